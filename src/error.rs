use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

/// Top-level error taxonomy for a simulation job.
///
/// The driver maps each variant to a job outcome: configuration problems are
/// fatal before a job row exists, infeasibility marks the job failed and
/// removes its rows, cancellation removes the job entirely.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    UnfillableDemand(#[from] UnfillableDemand),

    #[error(transparent)]
    Infeasibility(#[from] InfeasibilityError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("simulation stopped by cancellation request")]
    Stopped,
}

/// Configuration was missing, malformed, or semantically invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("unknown agent type '{0}'")]
    UnknownAgentType(String),

    #[error("no grid agent configured")]
    NoGridAgent,

    #[error("no grid agent configured for resource {0}")]
    NoGridAgentForResource(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("could not read configuration: {0}")]
    Io(String),
}

/// A horizon's demand cannot be met by any feasible schedule. Detected by the
/// pre-solve screens in the horizon assembler, before the MILP is built.
#[derive(Debug, Error)]
#[error("unfillable demand for agent(s) {agent_guids:?} at hour(s) {hours:?}")]
pub struct UnfillableDemand {
    pub agent_guids: Vec<String>,
    pub hours: Vec<usize>,
}

/// The solver reported a non-optimal termination for a horizon.
///
/// `constraint_names` holds the index-stripped names of violated constraint
/// families when the binding can identify them, and is empty otherwise.
#[derive(Debug, Error)]
#[error("infeasible optimization problem for horizon {horizon_start} - {horizon_end}")]
pub struct InfeasibilityError {
    pub agent_guids: Vec<String>,
    pub horizon_start: DateTime<Utc>,
    pub horizon_end: DateTime<Utc>,
    pub constraint_names: BTreeSet<String>,
}

/// A bulk insert or delete against the persistence sink failed.
#[derive(Debug, Error)]
#[error("persistence failure: {0}")]
pub struct PersistenceError(pub String);
