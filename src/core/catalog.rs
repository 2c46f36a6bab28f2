/// One row of the meta `catalog` table: a logical database name and its
/// optional data directory override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub db: String,
    pub dir: Option<String>,
}
