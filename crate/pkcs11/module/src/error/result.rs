use std::fmt::Display;

use super::ModuleError;

pub type ModuleResult<R> = Result<R, ModuleError>;

/// Attach a context to an error while keeping its Cryptoki return value.
pub trait MResultHelper<T> {
    fn context(self, context: &str) -> ModuleResult<T>;
    fn with_context<D, O>(self, op: O) -> ModuleResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D;
}

impl<T> MResultHelper<T> for ModuleResult<T> {
    fn context(self, context: &str) -> ModuleResult<T> {
        self.map_err(|e| ModuleError::Context {
            context: context.to_owned(),
            source: Box::new(e),
        })
    }

    fn with_context<D, O>(self, op: O) -> ModuleResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D,
    {
        self.map_err(|e| ModuleError::Context {
            context: op().to_string(),
            source: Box::new(e),
        })
    }
}

impl<T> MResultHelper<T> for Option<T> {
    fn context(self, context: &str) -> ModuleResult<T> {
        self.ok_or_else(|| ModuleError::Default(context.to_owned()))
    }

    fn with_context<D, O>(self, op: O) -> ModuleResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D,
    {
        self.ok_or_else(|| ModuleError::Default(op().to_string()))
    }
}
