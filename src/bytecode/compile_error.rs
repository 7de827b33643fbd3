#[derive(Debug, Clone)]
pub enum CompileError {
    /// A token that cannot start or continue the current construct.
    UnexpectedToken {
        found: String,
        line: usize,
        context: String,
        hint: Option<String>,
    },
    /// A jump target or operand that cannot be encoded.
    Encoding { reason: String },
    /// Internal compiler error (shouldn't happen in normal use).
    Internal(String),
}

impl CompileError {
    pub fn unexpected(found: impl std::fmt::Display, line: usize, context: &str) -> Self {
        CompileError::UnexpectedToken {
            found: found.to_string(),
            line,
            context: context.to_string(),
            hint: None,
        }
    }

    pub fn unexpected_with_hint(
        found: impl std::fmt::Display,
        line: usize,
        context: &str,
        hint: impl Into<String>,
    ) -> Self {
        CompileError::UnexpectedToken {
            found: found.to_string(),
            line,
            context: context.to_string(),
            hint: Some(hint.into()),
        }
    }

    pub fn encoding(reason: impl Into<String>) -> Self {
        CompileError::Encoding {
            reason: reason.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::UnexpectedToken {
                found,
                line,
                context,
                hint,
            } => {
                write!(
                    f,
                    "compile error: line {}: unexpected '{}' in {}",
                    line, found, context
                )?;
                if let Some(h) = hint {
                    write!(f, "\n  hint: {}", h)?;
                }
                Ok(())
            }
            CompileError::Encoding { reason } => {
                write!(f, "compile error: cannot encode: {}", reason)
            }
            CompileError::Internal(msg) => {
                write!(f, "compile error: internal: {}", msg)
            }
        }
    }
}
