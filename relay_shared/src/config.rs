//! Server configuration.
//!
//! `Server.cfg` is a line-oriented key-value file: `key = value` or
//! `key = "value"`, with `#` starting a comment. All keys are required.
//! A missing file is generated from a commented template so the operator
//! can fill in the backend key.

use std::collections::HashMap;
use std::io;
use std::path::Path;

/// Default configuration written when no file exists.
pub const DEFAULT_TEMPLATE: &str = r#"# Relay server configuration
Debug = false # true or false to enable debug log output
Private = false # hide the server from the public list
Port = 30814 # port to serve on, TCP and UDP
Cars = 1 # vehicle cap per player
MaxPlayers = 10 # player cap (development roles bypass this)
Map = "/levels/gridmap/info.json" # map handed to joining clients
Name = "Relay Server" # server name
Desc = "A vehicular relay server" # server description
use = "Resources" # resource directory
AuthKey = "" # backend authentication key
"#;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub debug: bool,
    pub is_private: bool,
    pub port: u16,
    pub max_cars: u8,
    pub max_players: u8,
    pub map: String,
    pub name: String,
    pub desc: String,
    pub resource_dir: String,
    pub auth_key: String,
}

/// Load failures map to distinct process exits: a generated default exits
/// cleanly, an empty auth key is fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found")]
    Missing,
    #[error("AuthKey must not be empty")]
    EmptyAuthKey,
    #[error("missing key `{0}`")]
    MissingKey(&'static str),
    #[error("invalid value for `{key}`: `{value}`")]
    Invalid { key: &'static str, value: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerConfig {
    /// Reads and validates the configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ConfigError::Missing),
            Err(e) => return Err(e.into()),
        };
        let cfg = Self::parse(&text)?;
        if cfg.auth_key.is_empty() {
            return Err(ConfigError::EmptyAuthKey);
        }
        Ok(cfg)
    }

    /// Writes the commented default template.
    pub fn write_default(path: &Path) -> io::Result<()> {
        std::fs::write(path, DEFAULT_TEMPLATE)
    }

    /// Parses the key-value grammar. Unknown keys are ignored.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            values.insert(key.trim().to_string(), unquote(value.trim()));
        }

        Ok(ServerConfig {
            debug: get_bool(&values, "Debug")?,
            is_private: get_bool(&values, "Private")?,
            port: get_num(&values, "Port")?,
            max_cars: get_num(&values, "Cars")?,
            max_players: get_num(&values, "MaxPlayers")?,
            map: get_str(&values, "Map")?,
            name: get_str(&values, "Name")?,
            desc: get_str(&values, "Desc")?,
            resource_dir: get_str(&values, "use")?,
            auth_key: get_str(&values, "AuthKey")?,
        })
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

fn get_str(values: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    values
        .get(key)
        .cloned()
        .ok_or(ConfigError::MissingKey(key))
}

fn get_bool(values: &HashMap<String, String>, key: &'static str) -> Result<bool, ConfigError> {
    match get_str(values, key)?.as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
        }),
    }
}

fn get_num<T: std::str::FromStr>(
    values: &HashMap<String, String>,
    key: &'static str,
) -> Result<T, ConfigError> {
    let raw = get_str(values, key)?;
    raw.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_template() {
        let cfg = ServerConfig::parse(DEFAULT_TEMPLATE).unwrap();
        assert!(!cfg.debug);
        assert!(!cfg.is_private);
        assert_eq!(cfg.port, 30814);
        assert_eq!(cfg.max_cars, 1);
        assert_eq!(cfg.max_players, 10);
        assert_eq!(cfg.map, "/levels/gridmap/info.json");
        assert_eq!(cfg.resource_dir, "Resources");
        assert!(cfg.auth_key.is_empty());
    }

    #[test]
    fn quotes_and_comments() {
        let cfg = ServerConfig::parse(
            "Debug = true\nPrivate = false # hidden\nPort = 1234\nCars = 4\n\
             MaxPlayers = 32\nMap = \"gridmap\"\nName = \"My Server\"\n\
             Desc = plain text\nuse = \"Mods\"\nAuthKey = \"k\"\n",
        )
        .unwrap();
        assert!(cfg.debug);
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.name, "My Server");
        assert_eq!(cfg.desc, "plain text");
        assert_eq!(cfg.auth_key, "k");
    }

    #[test]
    fn missing_key_reported() {
        let err = ServerConfig::parse("Debug = false\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(_)));
    }

    #[test]
    fn bad_value_reported() {
        let text = DEFAULT_TEMPLATE.replace("Port = 30814", "Port = lots");
        let err = ServerConfig::parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "Port", .. }));
    }
}
