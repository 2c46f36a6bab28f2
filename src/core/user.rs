/// One row of the meta `user` table. `(host, user, protocol)` is the
/// identity key; `password` holds the stored (derived) form, NULL for the
/// trust method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub host: String,
    pub user: String,
    pub password: Option<String>,
    pub protocol: String,
    pub auth_method: String,
    pub sa: bool,
}

impl User {
    pub fn is_sa(&self) -> bool {
        self.sa
    }

    /// A host pattern of `%` matches any client host.
    pub fn host_matches(&self, host: &str) -> bool {
        self.host == "%" || self.host.eq_ignore_ascii_case(host)
    }
}
