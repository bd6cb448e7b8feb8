use crate::client::consts::{BASE_URL, DEFAULT_MODEL};
use secrecy::SecretString;

/// Connection settings for one realtime session. The credential is the short-lived secret
/// minted per lecture, never a long-lived API key.
pub struct Config {
    base_url: String,
    credential: SecretString,
    model: String,
    beta_header: bool,
}

pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_credential(mut self, credential: SecretString) -> Self {
        self.config.credential = credential;
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.config.model = model.to_string();
        self
    }

    pub fn with_beta_header(mut self, enabled: bool) -> Self {
        self.config.beta_header = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            credential: SecretString::from(String::new()),
            model: DEFAULT_MODEL.to_string(),
            beta_header: false,
        }
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credential(&self) -> &SecretString {
        &self.credential
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn beta_header(&self) -> bool {
        self.beta_header
    }
}
