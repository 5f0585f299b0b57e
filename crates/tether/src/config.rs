/// Default nesting limit for converting native results into host values.
pub const DEFAULT_MAX_RESULT_DEPTH: usize = 64;

/// Tunables for a [`Session`](crate::Session).
///
/// Deserializes with every field optional, so a partial JSON document such as
/// `{"max_call_args": 8}` keeps the defaults for everything else.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Convert panics escaping the native call entry point into `NativeFault`
    /// instead of unwinding through the host.
    pub catch_native_panics: bool,
    /// Maximum nesting of list/tuple results converted into host values.
    pub max_result_depth: usize,
    /// Maximum number of arguments per call; `None` means unlimited.
    pub max_call_args: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            catch_native_panics: true,
            max_result_depth: DEFAULT_MAX_RESULT_DEPTH,
            max_call_args: None,
        }
    }
}

impl BridgeConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn catch_native_panics(mut self, catch: bool) -> Self {
        self.catch_native_panics = catch;
        self
    }

    #[must_use]
    pub fn max_result_depth(mut self, depth: usize) -> Self {
        self.max_result_depth = depth;
        self
    }

    #[must_use]
    pub fn max_call_args(mut self, limit: usize) -> Self {
        self.max_call_args = Some(limit);
        self
    }

    /// Parses a config from JSON, filling unspecified fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
