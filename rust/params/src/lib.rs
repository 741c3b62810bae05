#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss
)]

//! Parameter files for klynge job campaigns.
//!
//! Parses the line-oriented `key value` format and expands sequence-valued
//! parameters into one [`Configuration`] per combination.

pub mod expr;
pub mod parser;
pub mod space;
pub mod value;

pub use expr::{Evaluator, ExprError};
pub use parser::{ConfigParser, Delimiter, ParseError};
pub use space::{Configuration, Configurations, ParameterSpace};
pub use value::{ParameterSet, Value};
