//! The scanner's output grammar: one JSON object per line.
//!
//! Good records go to stdout, broken ones to stderr:
//!
//! ```text
//! {"type":"plugfile","plugfile-type":"clap","path":"..."}
//! {"type":"plugin","plugfile-type":"clap","path":"...","name":"...","id":"...",
//!  "vendor":"...","version":"...","features":["..."],"has-gui":true,"has-params":true}
//! {"type":"broken-plugfile","plugfile-type":"clap","path":"...","error":"..."}
//! {"type":"broken-plugin","plugfile-type":"clap","path":"...","id":"...","error":"..."}
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScanRecord {
    #[serde(rename = "plugfile")]
    Plugfile {
        #[serde(rename = "plugfile-type")]
        plugfile_type: String,
        path: String,
    },

    #[serde(rename = "plugin")]
    Plugin {
        #[serde(rename = "plugfile-type")]
        plugfile_type: String,
        path: String,
        name: String,
        id: String,
        vendor: String,
        version: String,
        #[serde(default)]
        url: String,
        #[serde(default)]
        features: Vec<String>,
        #[serde(rename = "has-gui")]
        has_gui: bool,
        #[serde(rename = "has-params")]
        has_params: bool,
    },

    #[serde(rename = "broken-plugfile")]
    BrokenPlugfile {
        #[serde(rename = "plugfile-type")]
        plugfile_type: String,
        path: String,
        error: String,
    },

    #[serde(rename = "broken-plugin")]
    BrokenPlugin {
        #[serde(rename = "plugfile-type")]
        plugfile_type: String,
        path: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        id: String,
        #[serde(default)]
        vendor: String,
        #[serde(default)]
        version: String,
        error: String,
    },
}

impl ScanRecord {
    /// Serialize as one output line (no trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("record serialization is infallible")
    }

    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Broken records belong on stderr.
    pub fn is_broken(&self) -> bool {
        matches!(self, Self::BrokenPlugfile { .. } | Self::BrokenPlugin { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugfile_record_field_names() {
        let record = ScanRecord::Plugfile {
            plugfile_type: "clap".to_string(),
            path: "/p/verb.clap".to_string(),
        };
        let line = record.to_line();
        assert_eq!(line, r#"{"type":"plugfile","plugfile-type":"clap","path":"/p/verb.clap"}"#);
        assert_eq!(ScanRecord::parse(&line).unwrap(), record);
    }

    #[test]
    fn test_plugin_record_round_trip() {
        let record = ScanRecord::Plugin {
            plugfile_type: "clap".to_string(),
            path: "/p/verb.clap".to_string(),
            name: "MaGigaverb".to_string(),
            id: "studio.kx.distrho.MaGigaverb".to_string(),
            vendor: "DISTRHO".to_string(),
            version: "1.0".to_string(),
            url: String::new(),
            features: vec!["audio-effect".to_string(), "reverb".to_string()],
            has_gui: true,
            has_params: true,
        };
        let line = record.to_line();
        assert!(line.contains(r#""has-gui":true"#));
        assert!(line.contains(r#""plugfile-type":"clap""#));
        assert_eq!(ScanRecord::parse(&line).unwrap(), record);
    }

    #[test]
    fn test_broken_records_go_to_stderr() {
        let broken = ScanRecord::BrokenPlugin {
            plugfile_type: "clap".to_string(),
            path: "/p/bad.clap".to_string(),
            name: String::new(),
            id: "bad.plugin".to_string(),
            vendor: String::new(),
            version: String::new(),
            error: "clap_plugin.init failed".to_string(),
        };
        assert!(broken.is_broken());
        let good = ScanRecord::Plugfile {
            plugfile_type: "clap".to_string(),
            path: "/p/ok.clap".to_string(),
        };
        assert!(!good.is_broken());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ScanRecord::parse("not json").is_err());
        assert!(ScanRecord::parse(r#"{"type":"mystery"}"#).is_err());
    }
}
