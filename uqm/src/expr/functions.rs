//! Allow-listed scalar functions.

use crate::core::Value;
use crate::errors::ExpressionError;

/// Scalar functions callable from expressions.
///
/// Anything not listed here is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFunction {
    /// `ABS(x)`
    Abs,
    /// `ROUND(x[, digits])`
    Round,
    /// `FLOOR(x)`
    Floor,
    /// `CEIL(x)` / `CEILING(x)`
    Ceil,
    /// `SQRT(x)`
    Sqrt,
    /// `POWER(x, y)` / `POW(x, y)`
    Power,
    /// `COALESCE(a, b, ...)` / `IFNULL(a, b)`
    Coalesce,
    /// `NULLIF(a, b)`
    NullIf,
    /// `UPPER(s)`
    Upper,
    /// `LOWER(s)`
    Lower,
    /// `LENGTH(s)` / `LEN(s)`
    Length,
    /// `TRIM(s)`
    Trim,
    /// `CONCAT(a, b, ...)`
    Concat,
    /// `SUBSTR(s, start[, len])` (1-based)
    Substr,
    /// `GREATEST(a, b, ...)`
    Greatest,
    /// `LEAST(a, b, ...)`
    Least,
}

impl ScalarFunction {
    /// Resolves an allow-listed function by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let func = match name.to_ascii_uppercase().as_str() {
            "ABS" => Self::Abs,
            "ROUND" => Self::Round,
            "FLOOR" => Self::Floor,
            "CEIL" | "CEILING" => Self::Ceil,
            "SQRT" => Self::Sqrt,
            "POWER" | "POW" => Self::Power,
            "COALESCE" | "IFNULL" => Self::Coalesce,
            "NULLIF" => Self::NullIf,
            "UPPER" => Self::Upper,
            "LOWER" => Self::Lower,
            "LENGTH" | "LEN" => Self::Length,
            "TRIM" => Self::Trim,
            "CONCAT" => Self::Concat,
            "SUBSTR" | "SUBSTRING" => Self::Substr,
            "GREATEST" => Self::Greatest,
            "LEAST" => Self::Least,
            _ => return None,
        };
        Some(func)
    }

    /// Returns the canonical name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Abs => "ABS",
            Self::Round => "ROUND",
            Self::Floor => "FLOOR",
            Self::Ceil => "CEIL",
            Self::Sqrt => "SQRT",
            Self::Power => "POWER",
            Self::Coalesce => "COALESCE",
            Self::NullIf => "NULLIF",
            Self::Upper => "UPPER",
            Self::Lower => "LOWER",
            Self::Length => "LENGTH",
            Self::Trim => "TRIM",
            Self::Concat => "CONCAT",
            Self::Substr => "SUBSTR",
            Self::Greatest => "GREATEST",
            Self::Least => "LEAST",
        }
    }

    /// Returns the accepted argument count range (inclusive).
    #[must_use]
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Self::Abs | Self::Floor | Self::Ceil | Self::Sqrt => (1, 1),
            Self::Upper | Self::Lower | Self::Length | Self::Trim => (1, 1),
            Self::Round => (1, 2),
            Self::Power | Self::NullIf => (2, 2),
            Self::Substr => (2, 3),
            Self::Coalesce | Self::Concat | Self::Greatest | Self::Least => (1, usize::MAX),
        }
    }

    /// Applies the function to already evaluated arguments.
    ///
    /// Numeric and string functions propagate Null.
    ///
    /// # Errors
    ///
    /// Returns an error for arguments of the wrong type.
    pub fn call(&self, args: &[Value]) -> Result<Value, ExpressionError> {
        let (min, max) = self.arity();
        if args.len() < min || args.len() > max {
            return Err(ExpressionError::invalid_argument(
                self.name(),
                format!("wrong number of arguments ({})", args.len()),
            ));
        }

        match self {
            Self::Coalesce => Ok(args.iter().find(|v| !v.is_null()).cloned().unwrap_or_default()),
            Self::NullIf => Ok(if args[0].loose_eq(&args[1]) {
                Value::Null
            } else {
                args[0].clone()
            }),
            Self::Concat => Ok(Value::String(
                args.iter()
                    .filter(|v| !v.is_null())
                    .map(Value::to_display_string)
                    .collect(),
            )),
            Self::Greatest | Self::Least => self.extreme(args),
            _ if args.iter().any(Value::is_null) => Ok(Value::Null),
            _ => self.call_strict(args),
        }
    }

    fn extreme(&self, args: &[Value]) -> Result<Value, ExpressionError> {
        let mut best: Option<&Value> = None;
        for value in args.iter().filter(|v| !v.is_null()) {
            best = match best {
                None => Some(value),
                Some(current) => {
                    let ordering = value.compare(current).ok_or_else(|| {
                        ExpressionError::invalid_argument(self.name(), "arguments are not comparable")
                    })?;
                    let replace = if *self == Self::Greatest {
                        ordering.is_gt()
                    } else {
                        ordering.is_lt()
                    };
                    Some(if replace { value } else { current })
                }
            };
        }
        Ok(best.cloned().unwrap_or_default())
    }

    #[allow(clippy::cast_precision_loss)]
    fn call_strict(&self, args: &[Value]) -> Result<Value, ExpressionError> {
        match self {
            Self::Abs => match &args[0] {
                Value::Int(i) => Ok(i
                    .checked_abs()
                    .map_or(Value::Float((*i as f64).abs()), Value::Int)),
                other => Ok(Value::Float(self.number(other)?.abs())),
            },
            Self::Round => {
                let value = self.number(&args[0])?;
                let digits = match args.get(1) {
                    Some(d) => d.as_i64().ok_or_else(|| {
                        ExpressionError::invalid_argument(self.name(), "digits must be an integer")
                    })?,
                    None => 0,
                };
                let factor = 10f64.powi(i32::try_from(digits).unwrap_or(0));
                Ok(Value::Float((value * factor).round() / factor))
            }
            Self::Floor => Ok(Value::Float(self.number(&args[0])?.floor())),
            Self::Ceil => Ok(Value::Float(self.number(&args[0])?.ceil())),
            Self::Sqrt => {
                let value = self.number(&args[0])?;
                if value < 0.0 {
                    return Err(ExpressionError::invalid_argument(
                        self.name(),
                        "negative argument",
                    ));
                }
                Ok(Value::Float(value.sqrt()))
            }
            Self::Power => Ok(Value::Float(
                self.number(&args[0])?.powf(self.number(&args[1])?),
            )),
            Self::Upper => Ok(Value::String(self.text(&args[0])?.to_uppercase())),
            Self::Lower => Ok(Value::String(self.text(&args[0])?.to_lowercase())),
            Self::Trim => Ok(Value::String(self.text(&args[0])?.trim().to_string())),
            Self::Length => Ok(Value::from(self.text(&args[0])?.chars().count())),
            Self::Substr => {
                let text = self.text(&args[0])?;
                let start = args[1].as_i64().ok_or_else(|| {
                    ExpressionError::invalid_argument(self.name(), "start must be an integer")
                })?;
                let skip = usize::try_from(start.max(1) - 1).unwrap_or(0);
                let chars = text.chars().skip(skip);
                let result: String = match args.get(2) {
                    Some(len) => {
                        let len = len.as_i64().ok_or_else(|| {
                            ExpressionError::invalid_argument(self.name(), "length must be an integer")
                        })?;
                        chars.take(usize::try_from(len).unwrap_or(0)).collect()
                    }
                    None => chars.collect(),
                };
                Ok(Value::String(result))
            }
            Self::Coalesce | Self::NullIf | Self::Concat | Self::Greatest | Self::Least => {
                self.call(args)
            }
        }
    }

    fn number(&self, value: &Value) -> Result<f64, ExpressionError> {
        value.as_f64().ok_or_else(|| {
            ExpressionError::invalid_argument(
                self.name(),
                format!("expected a number, got {}", value.type_name()),
            )
        })
    }

    fn text<'a>(&self, value: &'a Value) -> Result<&'a str, ExpressionError> {
        value.as_str().ok_or_else(|| {
            ExpressionError::invalid_argument(
                self.name(),
                format!("expected a string, got {}", value.type_name()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(ScalarFunction::from_name("coalesce"), Some(ScalarFunction::Coalesce));
        assert_eq!(ScalarFunction::from_name("eval"), None);
        assert_eq!(ScalarFunction::from_name("__import__"), None);
    }

    #[test]
    fn test_numeric_functions() {
        let round = ScalarFunction::Round.call(&[Value::Float(2.346), Value::Int(2)]).unwrap();
        assert_eq!(round, Value::Float(2.35));
        assert_eq!(ScalarFunction::Abs.call(&[Value::Int(-3)]).unwrap(), Value::Int(3));
        assert_eq!(ScalarFunction::Abs.call(&[Value::Null]).unwrap(), Value::Null);
        assert!(ScalarFunction::Sqrt.call(&[Value::from("x")]).is_err());
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(
            ScalarFunction::Upper.call(&[Value::from("eu")]).unwrap(),
            Value::from("EU")
        );
        assert_eq!(
            ScalarFunction::Substr
                .call(&[Value::from("abcdef"), Value::Int(2), Value::Int(3)])
                .unwrap(),
            Value::from("bcd")
        );
        assert_eq!(
            ScalarFunction::Concat
                .call(&[Value::from("a"), Value::Null, Value::Int(1)])
                .unwrap(),
            Value::from("a1")
        );
    }

    #[test]
    fn test_coalesce_and_greatest() {
        assert_eq!(
            ScalarFunction::Coalesce
                .call(&[Value::Null, Value::Int(4), Value::Int(5)])
                .unwrap(),
            Value::Int(4)
        );
        assert_eq!(
            ScalarFunction::Greatest
                .call(&[Value::Int(4), Value::Float(7.5), Value::Null])
                .unwrap(),
            Value::Float(7.5)
        );
    }
}
