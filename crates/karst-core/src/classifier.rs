use crate::vfs::{Classification, Entry};

/// Analyzer invoked per path during backup. Implementations must not keep
/// cross-path state; the orchestrator calls them serially per path.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;
    fn file(&self, pathname: &str, entry: &Entry) -> Option<Classification>;
    fn directory(&self, pathname: &str, entry: &Entry) -> Option<Classification>;
}

/// Explicit classifier registry threaded through the backup, empty by
/// default.
#[derive(Default)]
pub struct ClassifierRegistry {
    classifiers: Vec<Box<dyn Classifier>>,
}

impl ClassifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, classifier: Box<dyn Classifier>) {
        self.classifiers.push(classifier);
    }

    pub fn classify_file(&self, pathname: &str, entry: &Entry) -> Vec<Classification> {
        self.classifiers
            .iter()
            .filter_map(|c| c.file(pathname, entry))
            .collect()
    }

    pub fn classify_directory(&self, pathname: &str, entry: &Entry) -> Vec<Classification> {
        self.classifiers
            .iter()
            .filter_map(|c| c.directory(pathname, entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::{RecordType, ScanRecord};
    use crate::vfs::FileInfo;

    struct ExtensionClassifier;

    impl Classifier for ExtensionClassifier {
        fn name(&self) -> &str {
            "extension"
        }

        fn file(&self, pathname: &str, _entry: &Entry) -> Option<Classification> {
            pathname.ends_with(".log").then(|| Classification {
                analyzer: "extension".to_string(),
                classes: vec!["log".to_string()],
            })
        }

        fn directory(&self, _pathname: &str, _entry: &Entry) -> Option<Classification> {
            None
        }
    }

    fn entry(pathname: &str) -> Entry {
        Entry::new(
            "/",
            &ScanRecord {
                record_type: RecordType::File,
                pathname: pathname.to_string(),
                target: None,
                file_info: FileInfo::default(),
                xattr_name: None,
                file_attributes: 0,
            },
        )
    }

    #[test]
    fn registry_collects_matching_classifications() {
        let mut registry = ClassifierRegistry::new();
        registry.register(Box::new(ExtensionClassifier));

        let hits = registry.classify_file("/var/app.log", &entry("/var/app.log"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].classes, vec!["log"]);
        assert!(registry
            .classify_file("/var/app.txt", &entry("/var/app.txt"))
            .is_empty());
    }

    #[test]
    fn empty_registry_classifies_nothing() {
        let registry = ClassifierRegistry::new();
        assert!(registry.classify_file("/a", &entry("/a")).is_empty());
    }
}
