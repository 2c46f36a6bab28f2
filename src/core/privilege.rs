/// Privilege names accepted by GRANT and REVOKE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    All,
    Select,
    Insert,
    Update,
    Delete,
    Attach,
    Vacuum,
    Create,
    Drop,
    Alter,
    Pragma,
}

impl Privilege {
    /// Case-insensitive lookup; unknown names fail the GRANT parse.
    pub fn parse(name: &str) -> Option<Privilege> {
        let lower = name.to_ascii_lowercase();
        Some(match lower.as_str() {
            "all" => Privilege::All,
            "select" => Privilege::Select,
            "insert" => Privilege::Insert,
            "update" => Privilege::Update,
            "delete" => Privilege::Delete,
            "attach" => Privilege::Attach,
            "vacuum" => Privilege::Vacuum,
            "create" => Privilege::Create,
            "drop" => Privilege::Drop,
            "alter" => Privilege::Alter,
            "pragma" => Privilege::Pragma,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Privilege::All => "all",
            Privilege::Select => "select",
            Privilege::Insert => "insert",
            Privilege::Update => "update",
            Privilege::Delete => "delete",
            Privilege::Attach => "attach",
            Privilege::Vacuum => "vacuum",
            Privilege::Create => "create",
            Privilege::Drop => "drop",
            Privilege::Alter => "alter",
            Privilege::Pragma => "pragma",
        }
    }
}
