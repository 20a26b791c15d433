/// Include/exclude lists deciding which tables take part in a run.
///
/// An empty include list admits every table; the exclude list always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl TableFilter {
    #[must_use]
    pub fn new<I, E, S>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self { include: normalize(include), exclude: normalize(exclude) }
    }

    /// Build from comma-joined lists such as `orders,users`.
    #[must_use]
    pub fn from_comma_lists(include: &str, exclude: &str) -> Self {
        Self::new(include.split(','), exclude.split(','))
    }

    #[must_use]
    pub fn allows(&self, table: &str) -> bool {
        if self.exclude.iter().any(|name| name == table) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|name| name == table)
    }
}

fn normalize<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| name.as_ref().trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
