//! Stoichiometry model: which free components build which bound species.
//!
//! Rows are bound species, columns are free components. A row with only
//! non-negative entries is a complex. A row with a single negative entry is
//! an open polymer of that component; any positive entries in the same row
//! are end caps carried once per chain.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use titra_core::{Result, TitraError};

/// Subscript marking an indefinite repeat count
pub const POLYMER_SUBSCRIPT: &str = "ₙ";

/// One polymer-forming row of the stoichiometry matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolymerRow {
    /// Row index in the full matrix
    pub row: usize,
    /// Self-associating component
    pub component: usize,
    /// End caps: (component, units per chain)
    pub caps: Vec<(usize, u32)>,
    /// Index into the `kabs` constants, for capped rows
    pub kabs_index: Option<usize>,
}

impl PolymerRow {
    pub fn is_capped(&self) -> bool {
        !self.caps.is_empty()
    }
}

/// Classified stoichiometry matrix with derived names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stoichiometry {
    components: Vec<String>,
    matrix: Array2<i32>,
    complex_rows: Vec<usize>,
    polymer_rows: Vec<PolymerRow>,
    self_associating: Vec<usize>,
    species_names: Vec<String>,
}

impl Stoichiometry {
    pub fn new(components: Vec<String>, matrix: Array2<i32>) -> Result<Self> {
        if components.is_empty() {
            return Err(TitraError::Configuration("no free components given".into()));
        }
        if matrix.ncols() != components.len() {
            return Err(TitraError::Configuration(format!(
                "stoichiometry has {} columns but {} component names",
                matrix.ncols(),
                components.len()
            )));
        }

        let mut complex_rows = Vec::new();
        let mut polymer_rows = Vec::new();
        let mut self_associating = Vec::new();
        let mut n_capped = 0;

        for (i, row) in matrix.rows().into_iter().enumerate() {
            if row.iter().all(|&m| m == 0) {
                return Err(TitraError::Configuration(format!(
                    "stoichiometry row {} is empty",
                    i
                )));
            }

            let negatives: Vec<usize> = row
                .iter()
                .enumerate()
                .filter(|(_, &m)| m < 0)
                .map(|(j, _)| j)
                .collect();

            match negatives.as_slice() {
                [] => complex_rows.push(i),
                [component] => {
                    let caps: Vec<(usize, u32)> = row
                        .iter()
                        .enumerate()
                        .filter(|(_, &m)| m > 0)
                        .map(|(j, &m)| (j, m.unsigned_abs()))
                        .collect();
                    let kabs_index = if caps.is_empty() {
                        None
                    } else {
                        n_capped += 1;
                        Some(n_capped - 1)
                    };
                    if !self_associating.contains(component) {
                        self_associating.push(*component);
                    }
                    polymer_rows.push(PolymerRow {
                        row: i,
                        component: *component,
                        caps,
                        kabs_index,
                    });
                }
                _ => {
                    return Err(TitraError::Configuration(format!(
                        "stoichiometry row {} has {} negative entries, at most one is allowed",
                        i,
                        negatives.len()
                    )))
                }
            }
        }

        let raw_names: Vec<String> = matrix
            .rows()
            .into_iter()
            .map(|row| species_label(&components, row.iter().copied()))
            .collect();
        let species_names = make_unique(raw_names);

        Ok(Self {
            components,
            matrix,
            complex_rows,
            polymer_rows,
            self_associating,
            species_names,
        })
    }

    /// Build from row vectors, e.g. `&[vec![1, 1], vec![1, 2]]`
    pub fn from_rows(components: &[&str], rows: &[Vec<i32>]) -> Result<Self> {
        let n = components.len();
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n) {
            return Err(TitraError::Configuration(format!(
                "stoichiometry row {} has {} entries, expected {}",
                i,
                row.len(),
                n
            )));
        }
        let flat: Vec<i32> = rows.iter().flatten().copied().collect();
        let matrix = Array2::from_shape_vec((rows.len(), n), flat)
            .map_err(|e| TitraError::Shape(e.to_string()))?;
        Self::new(components.iter().map(|s| s.to_string()).collect(), matrix)
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn matrix(&self) -> &Array2<i32> {
        &self.matrix
    }

    pub fn n_complexes(&self) -> usize {
        self.complex_rows.len()
    }

    pub fn n_polymers(&self) -> usize {
        self.polymer_rows.len()
    }

    pub fn n_capped(&self) -> usize {
        self.polymer_rows.iter().filter(|p| p.is_capped()).count()
    }

    pub fn complex_rows(&self) -> &[usize] {
        &self.complex_rows
    }

    pub fn polymer_rows(&self) -> &[PolymerRow] {
        &self.polymer_rows
    }

    /// Components with at least one polymer row, in order of first appearance
    pub fn self_associating(&self) -> &[usize] {
        &self.self_associating
    }

    /// Rows of the complex category only
    pub fn complex_matrix(&self) -> Array2<i32> {
        self.matrix.select(ndarray::Axis(0), &self.complex_rows)
    }

    /// Unique label of each row, in row order
    pub fn species_names(&self) -> &[String] {
        &self.species_names
    }

    pub fn complex_names(&self) -> Vec<String> {
        self.complex_rows
            .iter()
            .map(|&i| self.species_names[i].clone())
            .collect()
    }

    pub fn polymer_names(&self) -> Vec<String> {
        self.polymer_rows
            .iter()
            .map(|p| self.species_names[p.row].clone())
            .collect()
    }

    /// Length of a bound-concentration vector
    pub fn n_outputs(&self) -> usize {
        self.n_complexes() + 2 * self.n_polymers()
    }

    /// Display names of the bound vector: complexes, then polymer
    /// terminal/internal pairs
    pub fn output_names(&self) -> Vec<String> {
        let mut names = self.complex_names();
        for name in self.polymer_names() {
            names.push(format!("{} terminal", name));
            names.push(format!("{} internal", name));
        }
        names
    }

    /// Number of equilibrium constants the model needs
    pub fn n_variables(&self) -> usize {
        self.n_complexes() + 2 * self.self_associating.len() + self.n_capped()
    }

    /// Names of the solved-for constants: one per complex, a dimerization
    /// and an elongation constant per self-associating component, and one
    /// per capped polymer row
    pub fn variable_names(&self) -> Vec<String> {
        let mut names = self.complex_names();
        for &j in &self.self_associating {
            names.push(format!("{}{}", self.components[j], subscript(2)));
            names.push(format!("{}{}", self.components[j], POLYMER_SUBSCRIPT));
        }
        for p in self.polymer_rows.iter().filter(|p| p.is_capped()) {
            names.push(self.species_names[p.row].clone());
        }
        make_unique(names)
    }

    /// Which outputs contain the given component
    pub fn output_contains(&self, component: usize) -> Vec<bool> {
        let mut mask: Vec<bool> = self
            .complex_rows
            .iter()
            .map(|&i| self.matrix[[i, component]] > 0)
            .collect();
        for p in &self.polymer_rows {
            let present =
                p.component == component || p.caps.iter().any(|&(c, _)| c == component);
            mask.push(present);
            mask.push(present);
        }
        mask
    }

    /// Amount of each component held in the bound vector.
    ///
    /// A polymer row puts terminal + internal units on its own component and
    /// `units · terminal / 2` on each cap, since every chain has two ends.
    pub fn bound_totals(&self, bound: &Array1<f64>) -> Result<Array1<f64>> {
        if bound.len() != self.n_outputs() {
            return Err(TitraError::Shape(format!(
                "bound vector has {} entries, expected {}",
                bound.len(),
                self.n_outputs()
            )));
        }

        let mut totals = Array1::zeros(self.n_components());
        for (k, &i) in self.complex_rows.iter().enumerate() {
            for (j, &m) in self.matrix.row(i).iter().enumerate() {
                totals[j] += m as f64 * bound[k];
            }
        }

        let offset = self.n_complexes();
        for (r, p) in self.polymer_rows.iter().enumerate() {
            let terminal = bound[offset + 2 * r];
            let internal = bound[offset + 2 * r + 1];
            totals[p.component] += terminal + internal;
            for &(c, m) in &p.caps {
                totals[c] += m as f64 * terminal / 2.0;
            }
        }
        Ok(totals)
    }
}

/// Unicode subscript digits for `n`
pub fn subscript(n: u32) -> String {
    const DIGITS: [char; 10] = ['₀', '₁', '₂', '₃', '₄', '₅', '₆', '₇', '₈', '₉'];
    n.to_string()
        .chars()
        .filter_map(|c| c.to_digit(10).map(|d| DIGITS[d as usize]))
        .collect()
}

fn species_label(components: &[String], row: impl Iterator<Item = i32>) -> String {
    let mut label = String::new();
    for (name, m) in components.iter().zip(row) {
        match m {
            0 => {}
            1 => label.push_str(name),
            m if m < 0 => {
                label.push_str(name);
                label.push_str(POLYMER_SUBSCRIPT);
            }
            m => {
                label.push_str(name);
                label.push_str(&subscript(m.unsigned_abs()));
            }
        }
    }
    label
}

/// Append `(2)`, `(3)`, ... to repeated labels
fn make_unique(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let mut candidate = name.clone();
            let mut k = 2;
            while seen.contains(&candidate) {
                candidate = format!("{}({})", name, k);
                k += 1;
            }
            seen.insert(candidate.clone());
            candidate
        })
        .collect()
}
