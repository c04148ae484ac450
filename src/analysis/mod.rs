//! Post-sweep analysis.

pub mod error_model;

pub use error_model::{
    classify, group_by_key, Coefficients, ErrorBudget, ErrorModel, ErrorRecord, Quantity, Summary,
    Verdict,
};
