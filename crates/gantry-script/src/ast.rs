use gantry_types::SourceLocation;

/// A parsed script element: name, attributes in document order, child
/// elements, and the location of its opening tag.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<ScriptElement>,
    pub location: SourceLocation,
}

impl ScriptElement {
    /// Look up an attribute by exact name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }
}
