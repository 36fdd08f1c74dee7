use json::JsonValue;
use nalgebra::{Point3, Vector3};

use crate::{
    datatypes::{FixedSupport, GridResolution, LoadVector},
    error::{AbyssError, AbyssResult},
    optimizer::SimpParameters,
    solver::LinearSolverKind,
};

/// A validated optimization request
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationParams {
    pub fixed_supports: Vec<FixedSupport>,
    pub load_vectors: Vec<LoadVector>,
    pub volume_fraction: f64,
    pub nelx: usize,
    pub nely: usize,
    pub nelz: usize,
    pub penal: f64,
    pub rmin: f64,
    pub max_iterations: usize,
    pub tolx: f64,
}

impl Default for OptimizationParams {
    fn default() -> Self {
        OptimizationParams {
            fixed_supports: Vec::new(),
            load_vectors: Vec::new(),
            volume_fraction: 0.3,
            nelx: 60,
            nely: 20,
            nelz: 10,
            penal: 3.0,
            rmin: 1.5,
            max_iterations: 80,
            tolx: 0.01,
        }
    }
}

impl OptimizationParams {
    /// Parses a request document. Missing scalar keys take their defaults;
    /// the marker lists are required.
    pub fn from_json_str(text: &str) -> AbyssResult<OptimizationParams> {
        let params_json = match json::parse(text) {
            Ok(j) => j,
            Err(err) => {
                return Err(AbyssError::Input(format!(
                    "Error in parameters json: {err}"
                )))
            }
        };

        if !params_json.is_object() {
            return Err(AbyssError::Input(
                "Parameters json must be an object".to_owned(),
            ));
        }
        if !params_json.has_key("fixed_supports") {
            return Err(AbyssError::Input(
                "Parameters json missing fixed_supports field".to_owned(),
            ));
        }
        if !params_json.has_key("load_vectors") {
            return Err(AbyssError::Input(
                "Parameters json missing load_vectors field".to_owned(),
            ));
        }

        let defaults = OptimizationParams::default();

        let mut fixed_supports = Vec::new();
        for (i, support_json) in members_of(&params_json, "fixed_supports")?.enumerate() {
            let name = format!("fixed_supports[{i}]");
            fixed_supports.push(FixedSupport {
                position: Point3::from(parse_vec3(support_json, "position", &name)?),
                normal: parse_vec3(support_json, "normal", &name)?,
            });
        }

        let mut load_vectors = Vec::new();
        for (i, load_json) in members_of(&params_json, "load_vectors")?.enumerate() {
            let name = format!("load_vectors[{i}]");
            let magnitude = if load_json.has_key("magnitude") {
                match load_json["magnitude"].as_f64() {
                    Some(m) => m,
                    None => {
                        return Err(AbyssError::Input(format!(
                            "Bad value for magnitude in {name}"
                        )))
                    }
                }
            } else {
                1.0
            };
            load_vectors.push(LoadVector {
                position: Point3::from(parse_vec3(load_json, "position", &name)?),
                direction: parse_vec3(load_json, "direction", &name)?,
                magnitude,
            });
        }

        let params = OptimizationParams {
            fixed_supports,
            load_vectors,
            volume_fraction: float_or(&params_json, "volume_fraction", defaults.volume_fraction)?,
            nelx: count_or(&params_json, "nelx", defaults.nelx)?,
            nely: count_or(&params_json, "nely", defaults.nely)?,
            nelz: count_or(&params_json, "nelz", defaults.nelz)?,
            penal: float_or(&params_json, "penal", defaults.penal)?,
            rmin: float_or(&params_json, "rmin", defaults.rmin)?,
            max_iterations: count_or(&params_json, "max_iterations", defaults.max_iterations)?,
            tolx: float_or(&params_json, "tolx", defaults.tolx)?,
        };

        params.validate()?;
        Ok(params)
    }

    /// Reads and parses a request file
    pub fn from_file(path: &str) -> AbyssResult<OptimizationParams> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(_err) => {
                return Err(AbyssError::Input(format!(
                    "Unable to open parameters file {path}"
                )))
            }
        };
        Self::from_json_str(&text)
    }

    /// Enforces the accepted parameter ranges
    pub fn validate(&self) -> AbyssResult<()> {
        check_range("volume_fraction", self.volume_fraction, 0.05, 0.95)?;
        for (name, n) in [("nelx", self.nelx), ("nely", self.nely), ("nelz", self.nelz)] {
            check_range(name, n as f64, 4.0, 200.0)?;
        }
        check_range("penal", self.penal, 1.0, 5.0)?;
        check_range("rmin", self.rmin, 1.0, 5.0)?;
        check_range("max_iterations", self.max_iterations as f64, 1.0, 2000.0)?;
        check_range("tolx", self.tolx, 1e-4, 0.1)?;

        for (i, load) in self.load_vectors.iter().enumerate() {
            if !load.magnitude.is_finite() || load.direction.iter().any(|c| !c.is_finite()) {
                return Err(AbyssError::Input(format!(
                    "load_vectors[{i}] has a non-finite direction or magnitude"
                )));
            }
        }

        Ok(())
    }

    pub fn resolution(&self) -> GridResolution {
        GridResolution::new(self.nelx, self.nely, self.nelz)
    }

    pub fn simp(&self) -> SimpParameters {
        SimpParameters {
            volfrac: self.volume_fraction,
            penal: self.penal,
            rmin: self.rmin,
            tolx: self.tolx,
            max_iterations: self.max_iterations,
        }
    }
}

fn members_of<'a>(
    params_json: &'a JsonValue,
    key: &str,
) -> AbyssResult<impl Iterator<Item = &'a JsonValue>> {
    if !params_json[key].is_array() {
        return Err(AbyssError::Input(format!("{key} must be a list")));
    }
    Ok(params_json[key].members())
}

fn parse_vec3(parent: &JsonValue, key: &str, name: &str) -> AbyssResult<Vector3<f64>> {
    if !parent.has_key(key) {
        return Err(AbyssError::Input(format!("{name} is missing {key} field")));
    }

    let mut components = [0.0; 3];
    for (component, axis) in components.iter_mut().zip(["x", "y", "z"]) {
        *component = match parent[key][axis].as_f64() {
            Some(v) => v,
            None => {
                return Err(AbyssError::Input(format!(
                    "Bad value for {key}.{axis} in {name}"
                )))
            }
        };
    }

    Ok(Vector3::from(components))
}

fn float_or(params_json: &JsonValue, key: &str, default: f64) -> AbyssResult<f64> {
    if !params_json.has_key(key) {
        return Ok(default);
    }
    match params_json[key].as_f64() {
        Some(v) => Ok(v),
        None => Err(AbyssError::Input(format!("Bad value for {key}"))),
    }
}

fn count_or(params_json: &JsonValue, key: &str, default: usize) -> AbyssResult<usize> {
    if !params_json.has_key(key) {
        return Ok(default);
    }
    match params_json[key].as_usize() {
        Some(v) => Ok(v),
        None => Err(AbyssError::Input(format!(
            "Bad value for {key}, expected a non-negative integer"
        ))),
    }
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> AbyssResult<()> {
    if value.is_nan() || value < min || value > max {
        return Err(AbyssError::Input(format!(
            "{name} must be within [{min}, {max}], got {value}"
        )));
    }
    Ok(())
}

/// Fixed numerics of the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct SolverSettings {
    /// Young's modulus of solid material
    pub e0: f64,
    /// Stiffness floor of void material
    pub emin: f64,
    pub poisson_ratio: f64,

    /// Largest change of a design variable in one OC update
    pub move_limit: f64,
    pub lambda_lower: f64,
    pub lambda_upper: f64,
    /// Bisection stops once `(l2 - l1) / (l1 + l2)` falls to this
    pub bisection_tolerance: f64,
    pub bisection_max_steps: usize,

    /// Largest bounding-box extent after normalization
    pub target_size: f64,
    /// Marker search radius, in multiples of the smallest cell size
    pub radius_factor: f64,

    pub iso_level: f64,
    pub smoothing_passes: usize,
    pub smoothing_factor: f64,
    /// Longest boundary loop the repair pass will fill
    pub max_hole_edges: usize,

    pub linear_solver: LinearSolverKind,
    pub cg_relative_tolerance: f64,
    pub cg_max_iterations: u64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings {
            e0: 1.0,
            emin: 1e-9,
            poisson_ratio: 0.3,
            move_limit: 0.2,
            lambda_lower: 0.0,
            lambda_upper: 1e9,
            bisection_tolerance: 1e-3,
            bisection_max_steps: 200,
            target_size: 3.0,
            radius_factor: 1.5,
            iso_level: 0.5,
            smoothing_passes: 5,
            smoothing_factor: 0.5,
            max_hole_edges: 64,
            linear_solver: LinearSolverKind::Cholesky,
            cg_relative_tolerance: 1e-8,
            cg_max_iterations: 20_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = r#"{
        "fixed_supports": [
            {"position": {"x": -1.5, "y": 0.25, "z": 0.0}, "normal": {"x": -1.0, "y": 0.0, "z": 0.0}}
        ],
        "load_vectors": [
            {"position": {"x": 1.5, "y": 0.5, "z": 0.0}, "direction": {"x": 0.0, "y": -1.0, "z": 0.0}, "magnitude": 2.5},
            {"position": {"x": 1.5, "y": 0.5, "z": 0.2}, "direction": {"x": 0.0, "y": -1.0, "z": 0.0}}
        ],
        "nelx": 30,
        "volume_fraction": 0.4
    }"#;

    #[test]
    fn parses_request_and_fills_defaults() {
        let params = OptimizationParams::from_json_str(REQUEST).unwrap();

        assert_eq!(params.fixed_supports.len(), 1);
        assert_eq!(params.fixed_supports[0].normal, Vector3::new(-1.0, 0.0, 0.0));
        assert_eq!(params.load_vectors[0].magnitude, 2.5);
        assert_eq!(params.load_vectors[1].magnitude, 1.0);
        assert_eq!(params.load_vectors[1].position, Point3::new(1.5, 0.5, 0.2));

        assert_eq!(params.resolution(), GridResolution::new(30, 20, 10));
        assert_eq!(params.volume_fraction, 0.4);
        assert_eq!(params.max_iterations, 80);
        assert_eq!(params.simp().penal, 3.0);
    }

    #[test]
    fn rejects_missing_marker_lists() {
        let err = OptimizationParams::from_json_str(r#"{"load_vectors": []}"#).unwrap_err();
        assert!(matches!(err, AbyssError::Input(msg) if msg.contains("fixed_supports")));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for body in [
            r#""volume_fraction": 0.99"#,
            r#""nelx": 3"#,
            r#""nelz": 201"#,
            r#""penal": 0.5"#,
            r#""rmin": 6"#,
            r#""max_iterations": 0"#,
            r#""tolx": 0.5"#,
            r#""nely": -4"#,
        ] {
            let text = format!(r#"{{"fixed_supports": [], "load_vectors": [], {body}}}"#);
            assert!(
                OptimizationParams::from_json_str(&text).is_err(),
                "accepted {body}"
            );
        }
    }

    #[test]
    fn rejects_malformed_vectors() {
        let text = r#"{"fixed_supports": [{"position": {"x": 0, "y": "a", "z": 0}, "normal": {"x": 0, "y": 1, "z": 0}}], "load_vectors": []}"#;
        let err = OptimizationParams::from_json_str(text).unwrap_err();
        assert!(matches!(err, AbyssError::Input(msg) if msg.contains("position.y")));

        assert!(OptimizationParams::from_json_str("not json").is_err());
    }

    #[test]
    fn default_settings() {
        let settings = SolverSettings::default();
        assert_eq!(settings.emin, 1e-9);
        assert_eq!(settings.move_limit, 0.2);
        assert_eq!(settings.linear_solver, LinearSolverKind::Cholesky);
    }
}
