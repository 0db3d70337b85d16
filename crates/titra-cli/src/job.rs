//! JSON job files.
//!
//! ```json
//! {
//!   "components": ["H", "G"],
//!   "stoichiometry": [[1, 1], [-1, 0]],
//!   "complex": [1e4],
//!   "polymer": [{ "component": "H", "k2": 100, "kn": { "InitialGuess": 1e3 } }],
//!   "totals": [[1e-3, 0.0], [1e-3, 5e-4]],
//!   "schedule": "two-pass",
//!   "signals": [[7.10, 2.2], [null, 2.4]],
//!   "contributors": ["H", "HG"]
//! }
//! ```
//!
//! Constants are plain numbers or [`Parameter`] values; fitted slots are
//! evaluated at their initial guess.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use titra_core::{resolve, Parameter, Result, Schedule, SolverOptions, TitraError};
use titra_signal::SpeciesColumn;
use titra_speciation::{Stoichiometry, WarmStart};

/// A constant given either as a bare number or as a tagged parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstantEntry {
    Value(f64),
    Parameter(Parameter),
}

impl From<ConstantEntry> for Parameter {
    fn from(entry: ConstantEntry) -> Self {
        match entry {
            ConstantEntry::Value(v) => Parameter::Known(v),
            ConstantEntry::Parameter(p) => p,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolymerEntry {
    pub component: String,
    pub k2: ConstantEntry,
    pub kn: ConstantEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub components: Vec<String>,
    pub stoichiometry: Vec<Vec<i32>>,
    #[serde(default)]
    pub complex: Vec<ConstantEntry>,
    #[serde(default)]
    pub polymer: Vec<PolymerEntry>,
    #[serde(default)]
    pub kabs: Vec<ConstantEntry>,
    pub totals: Vec<Vec<f64>>,
    #[serde(default)]
    pub options: SolverOptions,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub warm_start: WarmStart,
    /// Observed signal per point and channel; `null` marks an unmeasured point
    #[serde(default)]
    pub signals: Option<Vec<Vec<Option<f64>>>>,
    /// Species names whose concentrations carry the signal
    #[serde(default)]
    pub contributors: Vec<String>,
}

impl Job {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn stoichiometry(&self) -> Result<Stoichiometry> {
        let n = self.components.len();
        let matrix = table(&self.stoichiometry, n, "stoichiometry")
            .map_err(|e| TitraError::Configuration(e.to_string()))?;
        Stoichiometry::new(self.components.clone(), matrix)
    }

    /// Constant slots ordered like [`Stoichiometry::variable_names`]
    pub fn parameters(&self, stoich: &Stoichiometry) -> Result<Vec<Parameter>> {
        let mut params: Vec<Parameter> = self.complex.iter().map(|&c| c.into()).collect();

        for &j in stoich.self_associating() {
            let name = &stoich.components()[j];
            let entry = self
                .polymer
                .iter()
                .find(|p| &p.component == name)
                .ok_or_else(|| {
                    TitraError::Configuration(format!("no k2/kn given for polymer of {}", name))
                })?;
            params.push(entry.k2.into());
            params.push(entry.kn.into());
        }
        if let Some(extra) = self
            .polymer
            .iter()
            .find(|p| !stoich.self_associating().iter().any(|&j| stoich.components()[j] == p.component))
        {
            return Err(TitraError::Configuration(format!(
                "k2/kn given for {}, which forms no polymer",
                extra.component
            )));
        }

        params.extend(self.kabs.iter().map(|&c| Parameter::from(c)));
        if params.len() != stoich.n_variables() {
            return Err(TitraError::Configuration(format!(
                "model needs {} constants ({}), job gives {}",
                stoich.n_variables(),
                stoich.variable_names().join(", "),
                params.len()
            )));
        }
        Ok(params)
    }

    /// Constant values, with fitted slots at their initial guess
    pub fn constants(&self, stoich: &Stoichiometry) -> Result<Vec<f64>> {
        let params = self.parameters(stoich)?;
        let names = stoich.variable_names();
        let mut fitted = Vec::new();
        for (name, p) in names.iter().zip(&params) {
            match p {
                Parameter::Known(_) => {}
                Parameter::InitialGuess(v) => fitted.push(*v),
                Parameter::Unknown => {
                    return Err(TitraError::Configuration(format!(
                        "constant {} is unknown and has no initial guess",
                        name
                    )))
                }
            }
        }
        resolve(&params, &fitted)
    }

    pub fn totals(&self) -> Result<Array2<f64>> {
        table(&self.totals, self.components.len(), "totals")
    }

    /// Signals with unmeasured points as NaN
    pub fn signals(&self) -> Result<Option<Array2<f64>>> {
        let Some(rows) = &self.signals else {
            return Ok(None);
        };
        let rows: Vec<Vec<f64>> = rows
            .iter()
            .map(|r| r.iter().map(|s| s.unwrap_or(f64::NAN)).collect())
            .collect();
        let width = rows.first().map_or(0, Vec::len);
        table(&rows, width, "signals").map(Some)
    }

    /// Map contributor names onto free components or bound outputs
    pub fn contributors(&self, stoich: &Stoichiometry) -> Result<Vec<SpeciesColumn>> {
        if self.contributors.is_empty() {
            return Err(TitraError::Configuration(
                "signals given but no contributors named".into(),
            ));
        }
        let outputs = stoich.output_names();
        self.contributors
            .iter()
            .map(|name| {
                if let Some(j) = stoich.components().iter().position(|c| c == name) {
                    Ok(SpeciesColumn::Free(j))
                } else if let Some(k) = outputs.iter().position(|o| o == name) {
                    Ok(SpeciesColumn::Bound(k))
                } else {
                    Err(TitraError::Configuration(format!(
                        "unknown contributor {} (species: {}, {})",
                        name,
                        stoich.components().join(", "),
                        outputs.join(", ")
                    )))
                }
            })
            .collect()
    }
}

/// Rectangular table from nested rows
fn table<T: Clone>(rows: &[Vec<T>], width: usize, what: &str) -> Result<Array2<T>> {
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(TitraError::Shape(format!(
            "{} row {} has {} entries, expected {}",
            what,
            i,
            row.len(),
            width
        )));
    }
    let flat: Vec<T> = rows.iter().flatten().cloned().collect();
    Array2::from_shape_vec((rows.len(), width), flat)
        .map_err(|e| TitraError::Shape(format!("{}: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"{
        "components": ["H", "G"],
        "stoichiometry": [[1, 1], [-1, 0], [-1, 1]],
        "complex": [1e4],
        "polymer": [{ "component": "H", "k2": 100, "kn": { "InitialGuess": 1e3 } }],
        "kabs": [{ "Known": 20 }],
        "totals": [[1e-3, 0.0], [1e-3, 5e-4]],
        "schedule": "two-pass",
        "options": { "max_iterations": 200 },
        "signals": [[7.1, 2.2], [null, 2.4]],
        "contributors": ["H", "HG"]
    }"#;

    #[test]
    fn test_parse_job() {
        let job = Job::from_json(JOB).unwrap();
        let stoich = job.stoichiometry().unwrap();
        assert_eq!(stoich.variable_names(), vec!["HG", "H₂", "Hₙ", "HₙG"]);

        let params = job.parameters(&stoich).unwrap();
        assert_eq!(params[2], Parameter::InitialGuess(1e3));
        assert_eq!(titra_core::fitted_count(&params), 1);
        assert_eq!(job.constants(&stoich).unwrap(), vec![1e4, 100.0, 1e3, 20.0]);

        assert_eq!(job.schedule, Schedule::TwoPass);
        assert_eq!(job.options.max_iterations, 200);
        assert_eq!(job.totals().unwrap().dim(), (2, 2));

        let signals = job.signals().unwrap().unwrap();
        assert!(signals[[1, 0]].is_nan());
        assert_eq!(
            job.contributors(&stoich).unwrap(),
            vec![SpeciesColumn::Free(0), SpeciesColumn::Bound(0)]
        );
    }

    #[test]
    fn test_unknown_without_guess() {
        let text = JOB.replace(r#"{ "InitialGuess": 1e3 }"#, r#""Unknown""#);
        let job = Job::from_json(&text).unwrap();
        let stoich = job.stoichiometry().unwrap();
        let err = job.constants(&stoich).unwrap_err();
        assert!(err.to_string().contains("Hₙ"));
    }

    #[test]
    fn test_ragged_tables() {
        let text = JOB.replace("[1e-3, 5e-4]]", "[1e-3]]");
        let job = Job::from_json(&text).unwrap();
        assert!(matches!(job.totals(), Err(TitraError::Shape(_))));

        let text = JOB.replace("[[1, 1], [-1, 0], [-1, 1]]", "[[1, 1], [-1]]");
        let job = Job::from_json(&text).unwrap();
        assert!(matches!(job.stoichiometry(), Err(TitraError::Configuration(_))));
    }

    #[test]
    fn test_missing_polymer_constants() {
        let text = JOB.replace(r#""component": "H""#, r#""component": "G""#);
        let job = Job::from_json(&text).unwrap();
        let stoich = job.stoichiometry().unwrap();
        assert!(matches!(job.parameters(&stoich), Err(TitraError::Configuration(_))));
    }

    #[test]
    fn test_unknown_contributor() {
        let text = JOB.replace(r#"["H", "HG"]"#, r#"["HG₂"]"#);
        let job = Job::from_json(&text).unwrap();
        let stoich = job.stoichiometry().unwrap();
        assert!(job.contributors(&stoich).is_err());
    }
}
