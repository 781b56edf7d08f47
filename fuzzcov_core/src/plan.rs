use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Which corpus inputs a target is replayed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusSelector {
    /// Bare invocation, no corpus arguments.
    None,
    /// Every file in the corpus directory. The directory is listed lazily, only
    /// when per-file replay is needed.
    All,
    /// Exactly these file names inside the corpus directory.
    Subset(Vec<String>),
}

/// Everything needed to replay one fuzz target and collect its profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPlan {
    pub name: String,
    /// Binary followed by its fixed arguments. Corpus arguments are appended
    /// at run time.
    pub command: Vec<String>,
    /// Overlay applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub corpus_dir: Option<PathBuf>,
    pub corpus_selector: CorpusSelector,
    pub profile_dir: PathBuf,
    pub profile_path: PathBuf,
}

impl TargetPlan {
    /// Creates a plan with no corpus whose merged profile lands at
    /// `<profile_dir>/<name>.profdata`.
    pub fn new(name: impl Into<String>, command: Vec<String>, profile_dir: &Path) -> Self {
        let name = name.into();
        Self {
            profile_path: profile_path_for(profile_dir, &name),
            name,
            command,
            env: BTreeMap::new(),
            corpus_dir: None,
            corpus_selector: CorpusSelector::None,
            profile_dir: profile_dir.to_path_buf(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_corpus(mut self, corpus_dir: PathBuf, selector: CorpusSelector) -> Self {
        self.corpus_dir = Some(corpus_dir);
        self.corpus_selector = selector;
        self
    }

    /// Directory holding this target's raw fragments. Plan names are unique
    /// single path components and the `.fragments` suffix never matches a
    /// `.profdata` file, so no two targets share it.
    pub fn fragment_dir(&self) -> PathBuf {
        self.profile_dir.join(format!("{}.fragments", self.name))
    }

    /// Arguments appended to `command` for the whole-corpus attempt.
    pub fn whole_corpus_args(&self) -> Vec<String> {
        match (&self.corpus_selector, &self.corpus_dir) {
            (CorpusSelector::None, _) | (_, None) => Vec::new(),
            (CorpusSelector::All, Some(dir)) => vec![dir.to_string_lossy().into_owned()],
            (CorpusSelector::Subset(names), Some(dir)) => names
                .iter()
                .map(|n| dir.join(n).to_string_lossy().into_owned())
                .collect(),
        }
    }

    /// Resolves the selector to concrete corpus file names, in replay order.
    ///
    /// `All` reads the directory now, so files that appeared since planning are
    /// included. Only regular files are returned, sorted by name.
    pub fn corpus_members(&self) -> io::Result<Vec<String>> {
        match (&self.corpus_selector, &self.corpus_dir) {
            (CorpusSelector::None, _) | (_, None) => Ok(Vec::new()),
            (CorpusSelector::Subset(names), Some(_)) => Ok(names.clone()),
            (CorpusSelector::All, Some(dir)) => {
                let mut names = Vec::new();
                for entry in fs::read_dir(dir)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                names.sort();
                Ok(names)
            }
        }
    }
}

pub fn profile_path_for(profile_dir: &Path, name: &str) -> PathBuf {
    profile_dir.join(format!("{name}.profdata"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_path_is_namespaced_by_name() {
        let a = TargetPlan::new("a_fuzzer", vec!["bin/a".into()], Path::new("out/report"));
        let b = TargetPlan::new("b_fuzzer", vec!["bin/b".into()], Path::new("out/report"));
        assert_eq!(a.profile_path, PathBuf::from("out/report/a_fuzzer.profdata"));
        assert_ne!(a.profile_path, b.profile_path);
        assert_eq!(a.corpus_selector, CorpusSelector::None);
    }

    #[test]
    fn fragment_dirs_do_not_overlap_for_suffixed_names() {
        let t = TargetPlan::new("t", vec!["t".into()], Path::new("r"));
        let t0 = TargetPlan::new("t_0", vec!["t".into()], Path::new("r"));
        assert_eq!(t.fragment_dir(), PathBuf::from("r/t.fragments"));
        assert_eq!(t0.fragment_dir(), PathBuf::from("r/t_0.fragments"));
        assert_ne!(t.fragment_dir(), profile_path_for(Path::new("r"), "t.fragments"));
        assert!(!t.fragment_dir().starts_with(t0.fragment_dir()));
        assert!(!t0.fragment_dir().starts_with(t.fragment_dir()));
    }

    #[test]
    fn env_overlay_later_keys_win() {
        let plan = TargetPlan::new("t", vec!["t".into()], Path::new("r"))
            .with_env("DISPLAY", ":0")
            .with_env("DISPLAY", "not-a-real-display");
        assert_eq!(plan.env.get("DISPLAY").map(String::as_str), Some("not-a-real-display"));
    }

    #[test]
    fn whole_corpus_args_per_selector() {
        let base = TargetPlan::new("t", vec!["t".into()], Path::new("r"));
        assert!(base.whole_corpus_args().is_empty());

        let all = base.clone().with_corpus(PathBuf::from("corpora/t"), CorpusSelector::All);
        assert_eq!(all.whole_corpus_args(), vec!["corpora/t".to_string()]);

        let subset = base.with_corpus(
            PathBuf::from("js"),
            CorpusSelector::Subset(vec!["a.js".into(), "b.js".into()]),
        );
        assert_eq!(subset.whole_corpus_args(), vec!["js/a.js".to_string(), "js/b.js".to_string()]);
    }

    #[test]
    fn all_selector_lists_files_lazily() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plan = TargetPlan::new("t", vec!["t".into()], dir.path())
            .with_corpus(dir.path().join("corpus"), CorpusSelector::All);
        fs::create_dir(dir.path().join("corpus")).unwrap();
        fs::write(dir.path().join("corpus/b"), b"2").unwrap();
        fs::write(dir.path().join("corpus/a"), b"1").unwrap();
        fs::create_dir(dir.path().join("corpus/nested")).unwrap();

        assert_eq!(plan.corpus_members().unwrap(), vec!["a".to_string(), "b".to_string()]);

        fs::write(dir.path().join("corpus/c"), b"3").unwrap();
        assert_eq!(plan.corpus_members().unwrap().len(), 3);
    }

    #[test]
    fn subset_selector_keeps_given_order() {
        let plan = TargetPlan::new("t", vec!["t".into()], Path::new("r")).with_corpus(
            PathBuf::from("js"),
            CorpusSelector::Subset(vec!["z.js".into(), "a.js".into()]),
        );
        assert_eq!(plan.corpus_members().unwrap(), vec!["z.js".to_string(), "a.js".to_string()]);
    }
}
