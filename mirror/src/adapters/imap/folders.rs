use serde::Serialize;

/// Attributes that mark a LIST entry as something that cannot be examined.
const UNSELECTABLE_ATTRIBUTES: &[&str] = &["NoSelect", "NonExistent"];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FolderInfo {
    pub name: String,
    pub attributes: Vec<String>,
}

impl FolderInfo {
    pub fn new(name: String, attributes: Vec<String>) -> Self {
        Self { name, attributes }
    }

    /// Attributes arrive as rendered by the protocol parser, e.g.
    /// `NoSelect` or `Extension("\\NonExistent")`, so match by substring.
    pub fn is_selectable(&self) -> bool {
        !self.attributes.iter().any(|attr| {
            let attr = attr.to_ascii_lowercase();
            UNSELECTABLE_ATTRIBUTES
                .iter()
                .any(|flag| attr.contains(&flag.to_ascii_lowercase()))
        })
    }
}

pub fn selectable(folders: Vec<FolderInfo>) -> Vec<FolderInfo> {
    folders.into_iter().filter(FolderInfo::is_selectable).collect()
}
