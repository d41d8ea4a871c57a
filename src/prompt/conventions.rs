//! Repository convention files quoted into the prompt.

use std::path::Path;

use serde::Serialize;

/// One convention file as shown to the tool
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConventionSection {
    pub name: String,
    pub content: String,
}

/// Read each existing, non-empty file of `files` under `repo_root`, in order.
pub fn load_conventions(repo_root: &Path, files: &[String]) -> Vec<ConventionSection> {
    let mut sections = Vec::new();
    for name in files {
        let path = repo_root.join(name);
        if !path.is_file() {
            continue;
        }
        match std::fs::read(&path) {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes).trim().to_string();
                if !content.is_empty() {
                    sections.push(ConventionSection {
                        name: name.clone(),
                        content,
                    });
                }
            }
            Err(e) => log::warn!("skipping conventions file {}: {}", path.display(), e),
        }
    }
    sections
}
