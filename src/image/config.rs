//! The slice of the OCI image config consumed at launch

use serde::Deserialize;

/// Process configuration from the image: everything `run` needs to
/// assemble the container command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "Hostname", default)]
    pub hostname: String,

    #[serde(rename = "Env", default)]
    pub env: Vec<String>,

    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Vec<String>,

    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,
}

/// Top-level config file wrapper; only the `config` object matters here
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub config: ImageConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_alpine_config() {
        let raw = r#"{
            "architecture": "amd64",
            "config": {
                "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
                "Cmd": ["/bin/sh"]
            },
            "os": "linux"
        }"#;
        let parsed: ConfigFile = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.config.cmd, vec!["/bin/sh"]);
        assert!(parsed.config.entrypoint.is_empty());
        assert!(parsed.config.hostname.is_empty());
        assert_eq!(parsed.config.env.len(), 1);
    }

    #[test]
    fn missing_config_object_defaults_to_empty() {
        let parsed: ConfigFile = serde_json::from_str(r#"{"os":"linux"}"#).unwrap();
        assert!(parsed.config.cmd.is_empty());
        assert!(parsed.config.env.is_empty());
    }
}
