/// Overrides supplied by the embedding process.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra configuration file, loaded after the default locations.
    pub cfg_name: Option<String>,
}

impl Options {
    #[inline]
    pub fn with_cfg_name<N: Into<String>>(name: N) -> Self {
        Self { cfg_name: Some(name.into()) }
    }
}
