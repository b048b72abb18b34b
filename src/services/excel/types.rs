/// Which worksheet of a workbook to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetSelection {
    Index(usize),
    Name(String),
}

impl SheetSelection {
    /// A bare number selects by 0-based index, anything else by name.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<usize>() {
            Ok(index) => SheetSelection::Index(index),
            Err(_) => SheetSelection::Name(raw.to_string()),
        }
    }
}

impl std::fmt::Display for SheetSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SheetSelection::Index(i) => write!(f, "#{}", i),
            SheetSelection::Name(name) => write!(f, "'{}'", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_select_by_index() {
        assert_eq!(SheetSelection::parse("2"), SheetSelection::Index(2));
        assert_eq!(SheetSelection::parse("Sales 2024"), SheetSelection::Name("Sales 2024".into()));
    }
}
