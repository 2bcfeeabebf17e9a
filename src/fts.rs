//! Helpers for declaring FTS4 tables.
//!
//! ```rust,no_run
//! # use sqlhooks::{fts4_table_sql, Connection, Result, Tokenizer};
//! fn create(db: &Connection) -> Result<()> {
//!     let tokenizer = Tokenizer::unicode61(Some(true), "", "-");
//!     db.execute_batch(&fts4_table_sql("notes", &["title", "body"], Some(&tokenizer)))
//! }
//! ```
use std::fmt;

/// The `tokenize=` argument of an FTS3/FTS4 table declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tokenizer {
    name: String,
    arguments: Vec<String>,
}

impl Tokenizer {
    /// The built-in `simple` tokenizer.
    pub fn simple() -> Tokenizer {
        Tokenizer::new("simple", Vec::new())
    }

    /// The built-in `porter` stemming tokenizer.
    pub fn porter() -> Tokenizer {
        Tokenizer::new("porter", Vec::new())
    }

    /// The built-in `unicode61` tokenizer. Empty `tokenchars` or `separators`
    /// leave SQLite's defaults in place.
    pub fn unicode61(remove_diacritics: Option<bool>, tokenchars: &str, separators: &str) -> Tokenizer {
        let mut arguments = Vec::new();
        if let Some(remove) = remove_diacritics {
            arguments.push(quote(&format!("remove_diacritics={}", u8::from(remove))));
        }
        if !tokenchars.is_empty() {
            arguments.push(quote(&format!("tokenchars={tokenchars}")));
        }
        if !separators.is_empty() {
            arguments.push(quote(&format!("separators={separators}")));
        }
        Tokenizer::new("unicode61", arguments)
    }

    /// A tokenizer registered with
    /// [`Connection::register_tokenizer`](crate::Connection::register_tokenizer).
    pub fn custom(module: &str, tokenizer: &str) -> Tokenizer {
        Tokenizer::new(&quote(module), vec![quote(tokenizer)])
    }

    fn new(name: &str, arguments: Vec<String>) -> Tokenizer {
        Tokenizer {
            name: name.to_owned(),
            arguments,
        }
    }
}

impl fmt::Display for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for argument in &self.arguments {
            write!(f, " {argument}")?;
        }
        Ok(())
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// SQL creating the FTS4 virtual table `table` with `columns`, optionally
/// tokenized by `tokenizer`.
pub fn fts4_table_sql(table: &str, columns: &[&str], tokenizer: Option<&Tokenizer>) -> String {
    let mut arguments: Vec<String> = columns.iter().map(|column| quote(column)).collect();
    if let Some(tokenizer) = tokenizer {
        arguments.push(format!("tokenize={tokenizer}"));
    }
    format!(
        "CREATE VIRTUAL TABLE {} USING fts4({})",
        quote(table),
        arguments.join(", ")
    )
}

#[cfg(test)]
mod test {
    use super::{fts4_table_sql, Tokenizer};
    use crate::{params, Connection, Result};

    #[test]
    fn test_tokenizer_arguments() {
        assert_eq!(Tokenizer::simple().to_string(), "simple");
        assert_eq!(Tokenizer::porter().to_string(), "porter");
        assert_eq!(Tokenizer::unicode61(None, "", "").to_string(), "unicode61");
        assert_eq!(
            Tokenizer::unicode61(Some(false), "_", "").to_string(),
            r#"unicode61 "remove_diacritics=0" "tokenchars=_""#
        );
        assert_eq!(
            Tokenizer::custom("my\"module", "ws").to_string(),
            r#""my""module" "ws""#
        );
    }

    #[test]
    fn test_table_sql() {
        assert_eq!(
            fts4_table_sql("docs", &["title", "body"], None),
            r#"CREATE VIRTUAL TABLE "docs" USING fts4("title", "body")"#
        );
        assert_eq!(
            fts4_table_sql("docs", &["body"], Some(&Tokenizer::porter())),
            r#"CREATE VIRTUAL TABLE "docs" USING fts4("body", tokenize=porter)"#
        );
    }

    #[test]
    fn test_builtin_tokenizers() -> Result<()> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(&fts4_table_sql("stemmed", &["body"], Some(&Tokenizer::porter())))?;
        db.execute("INSERT INTO stemmed(body) VALUES (?1)", params!["running quickly"])?;
        let hits: i64 = db.query_row(
            "SELECT COUNT(*) FROM stemmed WHERE stemmed MATCH 'run'",
            params![],
            |r| r.get(0),
        )?;
        assert_eq!(hits, 1);

        let unicode = Tokenizer::unicode61(Some(true), "", "");
        db.execute_batch(&fts4_table_sql("folded", &["body"], Some(&unicode)))?;
        db.execute("INSERT INTO folded(body) VALUES (?1)", params!["Café"])?;
        let hits: i64 = db.query_row(
            "SELECT COUNT(*) FROM folded WHERE folded MATCH 'cafe'",
            params![],
            |r| r.get(0),
        )?;
        assert_eq!(hits, 1);
        Ok(())
    }
}
