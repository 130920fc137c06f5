use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

/// Interns categorical feature labels as u32 codes.
/// Codes are handed out in first-seen order, so they double as a stable ordinal.
#[derive(Debug)]
pub struct LabelDictionary {
    /// Label to code mapping (for encoding)
    label_to_code: DashMap<String, u32>,
    /// Code to label mapping (for decoding)
    code_to_label: RwLock<Vec<String>>,
    /// Next available code
    next_code: AtomicU32,
}

impl LabelDictionary {
    pub fn new() -> Self {
        Self {
            label_to_code: DashMap::new(),
            code_to_label: RwLock::new(Vec::new()),
            next_code: AtomicU32::new(0),
        }
    }

    /// Get or insert a label, returning its code
    pub fn get_or_insert(&self, label: &str) -> u32 {
        if let Some(code) = self.label_to_code.get(label) {
            return *code;
        }

        // Entry API keeps concurrent inserts of the same label consistent
        *self
            .label_to_code
            .entry(label.to_string())
            .or_insert_with(|| {
                let code = self.next_code.fetch_add(1, Ordering::SeqCst);
                let mut labels = self.code_to_label.write();
                if labels.len() <= code as usize {
                    labels.resize(code as usize + 1, String::new());
                }
                labels[code as usize] = label.to_string();
                code
            })
            .value()
    }

    /// Decode a code into an owned label
    pub fn get_label(&self, code: u32) -> Option<String> {
        let labels = self.code_to_label.read();
        labels.get(code as usize).cloned()
    }

    /// Look up the code for a label (without inserting)
    pub fn lookup(&self, label: &str) -> Option<u32> {
        self.label_to_code.get(label).map(|r| *r)
    }

    /// Decode with a closure to avoid cloning the label
    pub fn with_label<F, R>(&self, code: u32, f: F) -> Option<R>
    where
        F: FnOnce(&str) -> R,
    {
        let labels = self.code_to_label.read();
        labels.get(code as usize).map(|s| f(s))
    }

    /// Number of distinct labels
    pub fn len(&self) -> usize {
        self.label_to_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_to_code.is_empty()
    }
}

impl Default for LabelDictionary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_insert() {
        let dict = LabelDictionary::new();

        let a = dict.get_or_insert("gas");
        let b = dict.get_or_insert("coal");
        let c = dict.get_or_insert("gas");

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_codes_follow_first_seen_order() {
        let dict = LabelDictionary::new();
        assert_eq!(dict.get_or_insert("west"), 0);
        assert_eq!(dict.get_or_insert("east"), 1);
        assert_eq!(dict.get_or_insert("west"), 0);
        assert_eq!(dict.get_label(1), Some("east".to_string()));
        assert_eq!(dict.get_label(7), None);
    }

    #[test]
    fn test_lookup_and_with_label() {
        let dict = LabelDictionary::new();
        assert_eq!(dict.lookup("missing"), None);

        let code = dict.get_or_insert("solar");
        assert_eq!(dict.lookup("solar"), Some(code));
        assert_eq!(dict.with_label(code, |s| s.len()), Some(5));
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let dict = Arc::new(LabelDictionary::new());
        let mut handles = vec![];

        for i in 0..8 {
            let dict = Arc::clone(&dict);
            handles.push(thread::spawn(move || {
                for j in 0..50 {
                    dict.get_or_insert(&format!("label_{}_{}", i, j));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(dict.len(), 400);
    }
}
