use std::fmt::Display;

#[derive(Debug, Clone, PartialEq)]
pub enum AbyssError {
    /// Malformed or out-of-range request, parameters, or input mesh
    Input(String),
    /// Containment or extraction produced no usable geometry
    Geometry(String),
    /// Singular linear system or non-converging bisection
    Solver(String),
}

pub type AbyssResult<T> = Result<T, AbyssError>;

impl Display for AbyssError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (err_name, value) = match self {
            AbyssError::Input(v) => ("Input", v),
            AbyssError::Geometry(v) => ("Geometry", v),
            AbyssError::Solver(v) => ("Solver", v),
        };

        write!(f, "{} error: {}", err_name, value)
    }
}

impl std::error::Error for AbyssError {}

impl From<std::io::Error> for AbyssError {
    fn from(err: std::io::Error) -> Self {
        AbyssError::Input(format!("I/O failure: {err}"))
    }
}
