//! Protected partial application for check commands.
//!
//! Wraps a [`CheckCommand`] with bound arguments and a frozen set of
//! protected parameter names. Bound positional arguments always precede the
//! caller's; caller-supplied named arguments override the bound ones unless
//! the name is protected, in which case the caller's value is dropped
//! silently. This is how internal worker parameters are shielded from check
//! commands written by users.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::CheckError;
use crate::plugin::CheckCommand;

/// A [`CheckCommand`] with pre-bound arguments and protected names.
pub struct ProtectedPartial {
    inner: Arc<dyn CheckCommand>,
    bound_args: Vec<Value>,
    bound_kwargs: Map<String, Value>,
    protected: BTreeSet<String>,
}

impl ProtectedPartial {
    pub fn new(inner: Arc<dyn CheckCommand>) -> Self {
        Self {
            inner,
            bound_args: Vec::new(),
            bound_kwargs: Map::new(),
            protected: BTreeSet::new(),
        }
    }

    /// Append bound positional arguments.
    pub fn with_args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.bound_args.extend(args);
        self
    }

    /// Bind a named argument.
    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bound_kwargs.insert(name.into(), value);
        self
    }

    /// Freeze names the caller may not override.
    pub fn protect(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.protected.extend(names);
        self
    }
}

#[async_trait::async_trait]
impl CheckCommand for ProtectedPartial {
    async fn call(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, CheckError> {
        let mut full_args = self.bound_args.clone();
        full_args.extend_from_slice(args);

        let mut full_kwargs = self.bound_kwargs.clone();
        for (name, value) in kwargs {
            if !self.protected.contains(name) {
                full_kwargs.insert(name.clone(), value.clone());
            }
        }
        self.inner.call(&full_args, &full_kwargs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Parses args[0] as an integer string in the base given by kwarg "base".
    struct ParseIntCommand;

    #[async_trait::async_trait]
    impl CheckCommand for ParseIntCommand {
        async fn call(
            &self,
            args: &[Value],
            kwargs: &Map<String, Value>,
        ) -> Result<Value, CheckError> {
            let text = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| CheckError::check("missing input"))?;
            let base = kwargs.get("base").and_then(Value::as_u64).unwrap_or(10) as u32;
            let parsed = i64::from_str_radix(text, base)
                .map_err(|e| CheckError::check(e.to_string()))?;
            Ok(json!(parsed))
        }
    }

    fn partial() -> ProtectedPartial {
        ProtectedPartial::new(Arc::new(ParseIntCommand)).with_kwarg("base", json!(2))
    }

    #[tokio::test]
    async fn bound_kwargs_apply() {
        let cmd = partial();
        assert_eq!(cmd.call(&[json!("100")], &Map::new()).await.unwrap(), json!(4));
    }

    #[tokio::test]
    async fn caller_overrides_unprotected_kwargs() {
        let cmd = partial();
        let mut kwargs = Map::new();
        kwargs.insert("base".to_string(), json!(16));
        assert_eq!(cmd.call(&[json!("100")], &kwargs).await.unwrap(), json!(256));
    }

    #[tokio::test]
    async fn protected_kwargs_drop_caller_values() {
        let cmd = partial().protect(["base".to_string()]);
        let mut kwargs = Map::new();
        kwargs.insert("base".to_string(), json!(16));
        assert_eq!(cmd.call(&[json!("100")], &kwargs).await.unwrap(), json!(4));
    }

    #[tokio::test]
    async fn bound_positionals_precede_caller_positionals() {
        let cmd = ProtectedPartial::new(Arc::new(ParseIntCommand)).with_args([json!("11")]);
        // caller positionals land after the bound "11", which stays args[0]
        assert_eq!(
            cmd.call(&[json!("ignored")], &Map::new()).await.unwrap(),
            json!(11)
        );
    }
}
