//! Probability engine: weight balancing, weighted selection, epsilon-greedy
//! bandit distribution and chi-square significance.

pub mod balance;
pub mod bandit;
pub mod significance;

use indexmap::IndexMap;

/// Per-variant counts, in variant order.
pub type Counts = IndexMap<String, f64>;

/// Per-variant probabilities, in variant order.
pub type Distribution = IndexMap<String, f64>;

pub use balance::{balance_probabilities, round_to, select_with_probabilities};
pub use bandit::{bandit, conversion_rates, DEFAULT_EPSILON};
pub use significance::p_value;
