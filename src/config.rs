use std::path::PathBuf;
use std::time::Duration;

pub const API_URL_ENV: &str = "QUARRI_API_URL";
pub const DEFAULT_API_URL: &str = "https://app.quarri.ai";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Agent and analysis pipelines run several model and query rounds server-side.
pub const PIPELINE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Settings {
    pub base_url: String,
    pub default_timeout: Duration,
    pub pipeline_timeout: Duration,
    pub credentials_path: PathBuf,
}

impl Settings {
    pub fn new(base_url: impl Into<String>, credentials_path: PathBuf) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            default_timeout: DEFAULT_TIMEOUT,
            pipeline_timeout: PIPELINE_TIMEOUT,
            credentials_path,
        }
    }

    pub fn from_env() -> Self {
        let base_url = std::env::var(API_URL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Self::new(base_url, credentials_file_path())
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

pub fn credentials_file_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".quarri");
    path.push("credentials.json");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_trailing_slashes() {
        let s = Settings::new("http://localhost:8000/ ", PathBuf::from("c.json"));
        assert_eq!(s.base_url, "http://localhost:8000");
        assert_eq!(s.default_timeout, DEFAULT_TIMEOUT);
        assert!(s.pipeline_timeout > s.default_timeout);
    }

    #[test]
    fn credentials_live_under_dot_quarri() {
        let p = credentials_file_path();
        assert!(p.ends_with(".quarri/credentials.json"));
    }
}
