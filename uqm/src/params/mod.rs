//! Parameter declarations, validation and substitution.
//!
//! A run resolves parameters in three passes: supplied values are checked
//! against the declarations ([`resolve_parameters`]), conditional filters are
//! pruned ([`resolve_conditional_filters`]), then `$name` placeholders are
//! replaced throughout the step configs ([`substitute`]).

mod declaration;
mod substitute;

pub use declaration::{resolve_parameters, ParameterDecl, ParameterType};
pub use substitute::{
    referenced_parameters, resolve_conditional_filters, substitute, substitute_value, FILTER_KEYS,
};
