use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Effort budget for replaying a single target.
///
/// The defaults are tuned for large libFuzzer corpora on a build bot; a smaller
/// deployment will usually want shorter timeouts.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReplaySettings {
    #[serde(default = "default_whole_corpus_retries")]
    pub whole_corpus_retries: u32,
    #[serde(default = "default_whole_corpus_timeout_secs")]
    pub whole_corpus_timeout_secs: u64,
    #[serde(default = "default_individual_testcase_timeout_secs")]
    pub individual_testcase_timeout_secs: u64,
    #[serde(default = "default_individual_testcases_max_to_try")]
    pub individual_testcases_max_to_try: usize,
    #[serde(default = "default_individual_testcases_successes_needed")]
    pub individual_testcases_successes_needed: usize,
}

pub fn default_whole_corpus_retries() -> u32 {
    2
}
pub fn default_whole_corpus_timeout_secs() -> u64 {
    1200
}
pub fn default_individual_testcase_timeout_secs() -> u64 {
    60
}
pub fn default_individual_testcases_max_to_try() -> usize {
    500
}
pub fn default_individual_testcases_successes_needed() -> usize {
    100
}

impl ReplaySettings {
    pub fn whole_corpus_timeout(&self) -> Duration {
        Duration::from_secs(self.whole_corpus_timeout_secs)
    }

    pub fn individual_testcase_timeout(&self) -> Duration {
        Duration::from_secs(self.individual_testcase_timeout_secs)
    }
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            whole_corpus_retries: default_whole_corpus_retries(),
            whole_corpus_timeout_secs: default_whole_corpus_timeout_secs(),
            individual_testcase_timeout_secs: default_individual_testcase_timeout_secs(),
            individual_testcases_max_to_try: default_individual_testcases_max_to_try(),
            individual_testcases_successes_needed: default_individual_testcases_successes_needed(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessSettings {
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
    #[serde(default = "default_merge_tool")]
    pub merge_tool: PathBuf,
    #[serde(default = "default_merge_timeout_secs")]
    pub merge_timeout_secs: u64,
    #[serde(default = "default_rss_limit_mb")]
    pub rss_limit_mb: u64,
    /// Worker count. `None` means one worker per available CPU.
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default = "default_cold_start_binary")]
    pub cold_start_binary: String,
    #[serde(default = "default_fuzzilli_files_per_chunk")]
    pub fuzzilli_files_per_chunk: usize,
}

pub fn default_report_dir() -> PathBuf {
    PathBuf::from("out/report")
}
pub fn default_merge_tool() -> PathBuf {
    PathBuf::from("third_party/llvm-build/Release+Asserts/bin/llvm-profdata")
}
pub fn default_merge_timeout_secs() -> u64 {
    1200
}
pub fn default_rss_limit_mb() -> u64 {
    8192
}
pub fn default_cold_start_binary() -> String {
    "chrome".to_string()
}
pub fn default_fuzzilli_files_per_chunk() -> usize {
    10
}

impl HarnessSettings {
    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            report_dir: default_report_dir(),
            merge_tool: default_merge_tool(),
            merge_timeout_secs: default_merge_timeout_secs(),
            rss_limit_mb: default_rss_limit_mb(),
            parallelism: None,
            cold_start_binary: default_cold_start_binary(),
            fuzzilli_files_per_chunk: default_fuzzilli_files_per_chunk(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default)]
    pub replay: ReplaySettings,
    #[serde(default)]
    pub harness: HarnessSettings,
}

impl HarnessConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: HarnessConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config: HarnessConfig = toml::from_str("").expect("empty TOML should parse");
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.replay.whole_corpus_retries, 2);
        assert_eq!(config.replay.whole_corpus_timeout(), Duration::from_secs(1200));
        assert_eq!(config.replay.individual_testcase_timeout(), Duration::from_secs(60));
        assert_eq!(config.replay.individual_testcases_max_to_try, 500);
        assert_eq!(config.replay.individual_testcases_successes_needed, 100);
        assert_eq!(config.harness.report_dir, PathBuf::from("out/report"));
        assert_eq!(config.harness.parallelism, None);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let text = r#"
            [replay]
            whole-corpus-retries = 5
            individual-testcase-timeout-secs = 3

            [harness]
            parallelism = 4
            cold-start-binary = "content_shell"
        "#;
        let config: HarnessConfig = toml::from_str(text).expect("config should parse");
        assert_eq!(config.replay.whole_corpus_retries, 5);
        assert_eq!(config.replay.individual_testcase_timeout_secs, 3);
        assert_eq!(config.replay.whole_corpus_timeout_secs, 1200);
        assert_eq!(config.harness.parallelism, Some(4));
        assert_eq!(config.harness.cold_start_binary, "content_shell");
        assert_eq!(config.harness.rss_limit_mb, 8192);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = "[replay]\nwhole-corpus-retriez = 1\n";
        let err = toml::from_str::<HarnessConfig>(text).expect_err("typo should be rejected");
        assert!(
            err.to_string().contains("whole-corpus-retriez"),
            "Unexpected error: {err}"
        );
    }

    #[test]
    fn load_from_file_reports_missing_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        let err = HarnessConfig::load_from_file(&missing).expect_err("missing file must fail");
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn load_from_file_parses_contents() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[harness]\nreport-dir = \"/tmp/report\"").expect("write config");
        let config = HarnessConfig::load_from_file(file.path()).expect("config should load");
        assert_eq!(config.harness.report_dir, PathBuf::from("/tmp/report"));
    }
}
