//! Per-engine configuration. Unlike the teacher's own configuration module,
//! which holds a single process-wide static loaded once at startup, this
//! crate's `Config` is ordinary instance data: a process may host more than
//! one engine, each with its own cache size, strictness, and function/
//! fragment registrations, which rules out a shared global.

use crate::fragment::Fragment;
use crate::functions::FunctionRegistry;
use std::sync::Arc;

/// The default bound on `{{include}}` nesting depth.
pub const DEFAULT_MAX_INCLUDE_DEPTH: usize = 10;

/// A callback an embedder supplies to obtain a batch of functions at engine
/// construction time, e.g. to wire in host-application helpers without
/// hand-registering each one. Merged over the built-ins with
/// last-registered-wins, the same rule [`FunctionRegistry::extend`] uses for
/// any other batch merge.
pub type FunctionProvider = Arc<dyn Fn() -> FunctionRegistry + Send + Sync>;

/// Engine-wide configuration.
#[derive(Clone, serde::Deserialize)]
pub struct Config {
    /// Maximum number of prepared templates the engine's cache retains.
    /// Zero disables caching: every `prepare` call re-parses from scratch.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u32,
    /// Maximum `{{include}}` nesting depth before a render errors with
    /// [`crate::error::Error::IncludeDepthExceeded`].
    #[serde(default = "default_max_include_depth")]
    pub max_include_depth: usize,
    /// Promotes validation warnings (missing variables, unregistered
    /// functions and fragments) to hard errors.
    #[serde(default)]
    pub strict_mode: bool,
    /// The base function registry, before `function_provider` is applied.
    #[serde(skip)]
    pub function_registry: FunctionRegistry,
    /// An optional callback supplying additional functions, merged over
    /// `function_registry` with last-registered-wins.
    #[serde(skip)]
    pub function_provider: Option<FunctionProvider>,
    /// Fragments available to `{{include}}` at engine construction time.
    #[serde(skip)]
    pub fragments: Vec<Fragment>,
}

fn default_cache_capacity() -> u32 {
    64
}

fn default_max_include_depth() -> usize {
    DEFAULT_MAX_INCLUDE_DEPTH
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            max_include_depth: default_max_include_depth(),
            strict_mode: false,
            function_registry: FunctionRegistry::with_builtins(),
            function_provider: None,
            fragments: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("cache_capacity", &self.cache_capacity)
            .field("max_include_depth", &self.max_include_depth)
            .field("strict_mode", &self.strict_mode)
            .field("fragments", &self.fragments.iter().map(|f| &f.name).collect::<Vec<_>>())
            .field("function_provider", &self.function_provider.is_some())
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Builds the effective function registry: built-ins and any
    /// explicitly registered functions, with `function_provider`'s batch
    /// (if any) merged over the top.
    pub fn effective_functions(&self) -> FunctionRegistry {
        let mut functions = self.function_registry.clone();
        if let Some(provider) = &self.function_provider {
            functions.extend(provider());
        }
        functions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.cache_capacity, 64);
        assert_eq!(config.max_include_depth, DEFAULT_MAX_INCLUDE_DEPTH);
        assert!(!config.strict_mode);
        assert!(config.function_registry.contains("upper"));
    }

    #[test]
    fn function_provider_overrides_registered_functions() {
        let mut config = Config::default();
        config.function_provider = Some(Arc::new(|| {
            let mut reg = FunctionRegistry::new();
            reg.register("upper", 1, 1, |_| Ok(crate::value::Value::str("OVERRIDDEN")));
            reg
        }));
        let functions = config.effective_functions();
        let result = functions.get("upper").unwrap().call(&[crate::value::Value::str("x")]).unwrap();
        assert_eq!(result, crate::value::Value::str("OVERRIDDEN"));
    }

    #[test]
    fn deserializes_from_partial_json_with_defaults() {
        let config: Config = serde_json::from_str(r#"{"strict_mode": true}"#).unwrap();
        assert!(config.strict_mode);
        assert_eq!(config.cache_capacity, 64);
        assert!(!config.function_registry.contains("upper"));
    }
}
