use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoadStyle {
    DEFAULT,

    TOML,
}

/// CLI 回显格式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Format {
    Json,

    Yaml,

    None,
}

impl Format {
    pub fn format(f: &str) -> Format {
        match f.to_ascii_lowercase().as_str() {
            "json" => Format::Json,
            "yaml" | "yml" => Format::Yaml,
            _ => Format::None,
        }
    }
}
