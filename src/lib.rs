//! dsrules
//!
//! Classification rules as boolean conditions over feature rows:
//! - parsing rule text into a canonical condition tree
//! - compiling canonical conditions back into predicates
//! - a Dempster-Shafer rule classifier
//! - background training jobs with live progress and cooperative stop

pub mod classifier;
pub mod condition;
pub mod config;
pub mod dataset;
pub mod jobs;
pub mod metrics;
pub mod rules;
pub mod server;
pub mod telemetry;

// Re-exports for convenience
pub use classifier::{BeliefClassifier, DempsterShaferClassifier};
pub use condition::{ConditionError, ConditionNode, Predicate, ValueExpression};
pub use config::ServiceConfig;
pub use jobs::TrainingService;
pub use rules::{Rule, RuleBundle};
