#![deny(dead_code)]
#![deny(unused_imports)]

pub mod data;
pub mod faer_ndarray;
pub mod model;
pub mod pirls;
pub mod search;
pub mod sign;

#[cfg(test)]
mod test_fixtures;

pub use data::{DataError, PreparedData, Standardization, prepare};
pub use model::{
    Cluster, ClusterMember, ClusterSet, ConfigError, FitOptions, FlipMethod, ModelError,
    PeloraConfig, PenalizedModel, PredictionKind,
};
pub use pirls::PirlsError;
pub use search::{ClusterSearch, PeloraError, pelora};
pub use sign::Sign;
