//! MySQL DDL parsing
//!
//! Only the statements that can change a tracked table's column layout are
//! understood in detail. Everything else parses to [`DdlStatement::Other`].
//! The tokenizer handles backquoted identifiers, string literals, comments
//! and nested parentheses so type text such as `enum('a,b','c')` survives
//! intact.

use crate::common::{CdcError, ColumnDef, Result, SqlType, TableId};

/// Possibly unqualified table reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub database: Option<String>,
    pub table: String,
}

impl TableRef {
    pub fn resolve(&self, default_db: &str) -> TableId {
        TableId::new(
            self.database.clone().unwrap_or_else(|| default_db.to_string()),
            self.table.clone(),
        )
    }
}

/// Where an added or modified column lands in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ColumnPosition {
    #[default]
    Last,
    First,
    After(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlterOp {
    AddColumn {
        column: ColumnDef,
        position: ColumnPosition,
    },
    DropColumn(String),
    ModifyColumn {
        column: ColumnDef,
        position: ColumnPosition,
    },
    /// `CHANGE old new_def`; a rename when the names differ
    ChangeColumn {
        old: String,
        column: ColumnDef,
        position: ColumnPosition,
    },
    RenameColumn {
        from: String,
        to: String,
    },
    /// `ALTER COLUMN c SET DEFAULT x` / `DROP DEFAULT`
    AlterDefault {
        column: String,
        default: Option<String>,
    },
    RenameTable(TableRef),
    /// Indexes, keys, constraints and table options
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DdlStatement {
    AlterTable { table: TableRef, ops: Vec<AlterOp> },
    CreateTable { table: TableRef, columns: Vec<ColumnDef> },
    DropTable { tables: Vec<TableRef> },
    RenameTable { renames: Vec<(TableRef, TableRef)> },
    Truncate { table: TableRef },
    Other,
}

impl DdlStatement {
    /// Every table the statement touches, qualified against `default_db`.
    pub fn tables(&self, default_db: &str) -> Vec<TableId> {
        match self {
            DdlStatement::AlterTable { table, ops } => {
                let mut out = vec![table.resolve(default_db)];
                for op in ops {
                    if let AlterOp::RenameTable(to) = op {
                        out.push(to.resolve(default_db));
                    }
                }
                out
            }
            DdlStatement::CreateTable { table, .. } | DdlStatement::Truncate { table } => {
                vec![table.resolve(default_db)]
            }
            DdlStatement::DropTable { tables } => {
                tables.iter().map(|t| t.resolve(default_db)).collect()
            }
            DdlStatement::RenameTable { renames } => renames
                .iter()
                .flat_map(|(a, b)| [a.resolve(default_db), b.resolve(default_db)])
                .collect(),
            DdlStatement::Other => Vec::new(),
        }
    }
}

/// Parse one DDL statement.
pub fn parse(sql: &str) -> Result<DdlStatement> {
    let tokens = tokenize(sql)?;
    let mut p = Parser {
        sql,
        tokens,
        pos: 0,
    };
    p.statement()
}

/// Cheap check used to route QUERY events before a full parse.
pub fn is_transaction_control(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_uppercase();
    head.starts_with("BEGIN")
        || head.starts_with("COMMIT")
        || head.starts_with("ROLLBACK")
        || head.starts_with("XA ")
        || head.starts_with("SAVEPOINT")
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    /// Backquoted identifier
    Quoted(String),
    Str(String),
    Num(String),
    Sym(char),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    start: usize,
    end: usize,
}

fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let close = sql[i + 2..]
                    .find("*/")
                    .ok_or_else(|| CdcError::schema("unterminated comment in DDL"))?;
                i += close + 4;
            }
            b'`' | b'\'' | b'"' => {
                let start = i;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&b) = bytes.get(i) else {
                        return Err(CdcError::schema("unterminated quoted text in DDL"));
                    };
                    if b == c {
                        if bytes.get(i + 1) == Some(&c) {
                            text.push(c as char);
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    if b == b'\\' && c != b'`' {
                        if let Some(ch) = sql[i + 1..].chars().next() {
                            text.push(ch);
                            i += 1 + ch.len_utf8();
                            continue;
                        }
                    }
                    let ch = sql[i..].chars().next().unwrap_or('\u{fffd}');
                    text.push(ch);
                    i += ch.len_utf8().max(1);
                }
                let tok = if c == b'`' {
                    Tok::Quoted(text)
                } else {
                    Tok::Str(text)
                };
                out.push(Token { tok, start, end: i });
            }
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                    i += 1;
                }
                out.push(Token {
                    tok: Tok::Num(sql[start..i].to_string()),
                    start,
                    end: i,
                });
            }
            _ if c.is_ascii_alphabetic() || c == b'_' || c == b'$' || c >= 0x80 => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'$'
                        || bytes[i] >= 0x80)
                {
                    i += 1;
                }
                out.push(Token {
                    tok: Tok::Word(sql[start..i].to_string()),
                    start,
                    end: i,
                });
            }
            _ => {
                let ch = sql[i..].chars().next().unwrap_or('?');
                out.push(Token {
                    tok: Tok::Sym(ch),
                    start: i,
                    end: i + ch.len_utf8(),
                });
                i += ch.len_utf8().max(1);
            }
        }
    }
    Ok(out)
}

struct Parser<'a> {
    sql: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), None | Some(Tok::Sym(';')))
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Word(w)) if w.eq_ignore_ascii_case(kw))
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_kws(&mut self, kws: &[&str]) -> bool {
        let save = self.pos;
        for kw in kws {
            if !self.eat_kw(kw) {
                self.pos = save;
                return false;
            }
        }
        true
    }

    fn is_sym(&self, c: char) -> bool {
        self.peek() == Some(&Tok::Sym(c))
    }

    fn eat_sym(&mut self, c: char) -> bool {
        if self.is_sym(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, c: char) -> Result<()> {
        if self.eat_sym(c) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c)))
        }
    }

    fn error(&self, what: &str) -> CdcError {
        let near = self
            .tokens
            .get(self.pos)
            .map(|t| &self.sql[t.start..])
            .unwrap_or("end of statement");
        let near: String = near.chars().take(40).collect();
        CdcError::schema(format!("DDL parse error: {} near '{}'", what, near))
    }

    fn ident(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Tok::Word(w)) | Some(Tok::Quoted(w)) => {
                self.pos += 1;
                Ok(w)
            }
            Some(Tok::Str(s)) => {
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn table_ref(&mut self) -> Result<TableRef> {
        let first = self.ident()?;
        if self.eat_sym('.') {
            let table = self.ident()?;
            Ok(TableRef {
                database: Some(first),
                table,
            })
        } else {
            Ok(TableRef {
                database: None,
                table: first,
            })
        }
    }

    /// Skip a balanced `( ... )` group starting at the current token.
    fn skip_group(&mut self) -> Result<()> {
        let mut depth = 0usize;
        while let Some(tok) = self.peek() {
            match tok {
                Tok::Sym('(') => depth += 1,
                Tok::Sym(')') => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| self.error("unbalanced ')'"))?;
                    if depth == 0 {
                        self.pos += 1;
                        return Ok(());
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        Err(self.error("unbalanced '('"))
    }

    /// Skip to the next top-level `,` or `)` (not consumed) or the end.
    fn skip_item(&mut self) -> Result<()> {
        while !self.at_end() {
            match self.peek() {
                Some(Tok::Sym(',')) | Some(Tok::Sym(')')) => return Ok(()),
                Some(Tok::Sym('(')) => self.skip_group()?,
                _ => self.pos += 1,
            }
        }
        Ok(())
    }

    fn statement(&mut self) -> Result<DdlStatement> {
        if self.eat_kw("ALTER") {
            self.eat_kw("ONLINE");
            self.eat_kw("IGNORE");
            if !self.eat_kw("TABLE") {
                return Ok(DdlStatement::Other);
            }
            return self.alter_table();
        }
        if self.eat_kw("CREATE") {
            self.eat_kw("TEMPORARY");
            if !self.eat_kw("TABLE") {
                return Ok(DdlStatement::Other);
            }
            self.eat_kws(&["IF", "NOT", "EXISTS"]);
            return self.create_table();
        }
        if self.eat_kw("DROP") {
            self.eat_kw("TEMPORARY");
            if !self.eat_kw("TABLE") && !self.eat_kw("TABLES") {
                return Ok(DdlStatement::Other);
            }
            self.eat_kws(&["IF", "EXISTS"]);
            let mut tables = vec![self.table_ref()?];
            while self.eat_sym(',') {
                tables.push(self.table_ref()?);
            }
            return Ok(DdlStatement::DropTable { tables });
        }
        if self.eat_kw("RENAME") {
            if !self.eat_kw("TABLE") && !self.eat_kw("TABLES") {
                return Ok(DdlStatement::Other);
            }
            let mut renames = Vec::new();
            loop {
                let from = self.table_ref()?;
                if !self.eat_kw("TO") {
                    return Err(self.error("expected TO"));
                }
                renames.push((from, self.table_ref()?));
                if !self.eat_sym(',') {
                    break;
                }
            }
            return Ok(DdlStatement::RenameTable { renames });
        }
        if self.eat_kw("TRUNCATE") {
            self.eat_kw("TABLE");
            return Ok(DdlStatement::Truncate {
                table: self.table_ref()?,
            });
        }
        Ok(DdlStatement::Other)
    }

    fn alter_table(&mut self) -> Result<DdlStatement> {
        let table = self.table_ref()?;
        let mut ops = Vec::new();
        while !self.at_end() {
            ops.extend(self.alter_op()?);
            self.skip_item()?;
            if !self.eat_sym(',') {
                break;
            }
        }
        Ok(DdlStatement::AlterTable { table, ops })
    }

    fn alter_op(&mut self) -> Result<Vec<AlterOp>> {
        if self.eat_kw("ADD") {
            if self.is_add_index() {
                return Ok(vec![AlterOp::Ignored]);
            }
            self.eat_kw("COLUMN");
            if self.eat_sym('(') {
                let mut ops = Vec::new();
                loop {
                    let column = self.column_def()?;
                    ops.push(AlterOp::AddColumn {
                        column,
                        position: ColumnPosition::Last,
                    });
                    self.skip_item()?;
                    if !self.eat_sym(',') {
                        break;
                    }
                }
                self.expect_sym(')')?;
                return Ok(ops);
            }
            let column = self.column_def()?;
            let position = self.column_position()?;
            return Ok(vec![AlterOp::AddColumn { column, position }]);
        }
        if self.eat_kw("DROP") {
            if self.eat_kw("COLUMN") {
                self.eat_kws(&["IF", "EXISTS"]);
                return Ok(vec![AlterOp::DropColumn(self.ident()?)]);
            }
            if self.is_kw("INDEX")
                || self.is_kw("KEY")
                || self.is_kw("PRIMARY")
                || self.is_kw("FOREIGN")
                || self.is_kw("CONSTRAINT")
                || self.is_kw("CHECK")
                || self.is_kw("PARTITION")
            {
                return Ok(vec![AlterOp::Ignored]);
            }
            return Ok(vec![AlterOp::DropColumn(self.ident()?)]);
        }
        if self.eat_kw("MODIFY") {
            self.eat_kw("COLUMN");
            let column = self.column_def()?;
            let position = self.column_position()?;
            return Ok(vec![AlterOp::ModifyColumn { column, position }]);
        }
        if self.eat_kw("CHANGE") {
            self.eat_kw("COLUMN");
            let old = self.ident()?;
            let column = self.column_def()?;
            let position = self.column_position()?;
            return Ok(vec![AlterOp::ChangeColumn {
                old,
                column,
                position,
            }]);
        }
        if self.eat_kw("RENAME") {
            if self.eat_kw("COLUMN") {
                let from = self.ident()?;
                if !self.eat_kw("TO") {
                    return Err(self.error("expected TO"));
                }
                return Ok(vec![AlterOp::RenameColumn {
                    from,
                    to: self.ident()?,
                }]);
            }
            if self.is_kw("INDEX") || self.is_kw("KEY") {
                return Ok(vec![AlterOp::Ignored]);
            }
            if !self.eat_kw("TO") {
                self.eat_kw("AS");
            }
            return Ok(vec![AlterOp::RenameTable(self.table_ref()?)]);
        }
        if self.eat_kw("ALTER") {
            if self.is_kw("INDEX") || self.is_kw("CHECK") || self.is_kw("CONSTRAINT") {
                return Ok(vec![AlterOp::Ignored]);
            }
            self.eat_kw("COLUMN");
            let column = self.ident()?;
            if self.eat_kws(&["SET", "DEFAULT"]) {
                let default = self.default_value()?;
                return Ok(vec![AlterOp::AlterDefault { column, default }]);
            }
            if self.eat_kws(&["DROP", "DEFAULT"]) {
                return Ok(vec![AlterOp::AlterDefault {
                    column,
                    default: None,
                }]);
            }
            return Ok(vec![AlterOp::Ignored]);
        }
        Ok(vec![AlterOp::Ignored])
    }

    fn is_add_index(&self) -> bool {
        [
            "INDEX", "KEY", "PRIMARY", "UNIQUE", "FULLTEXT", "SPATIAL", "CONSTRAINT", "FOREIGN",
            "CHECK", "PARTITION",
        ]
        .iter()
        .any(|kw| self.is_kw(kw))
    }

    fn column_position(&mut self) -> Result<ColumnPosition> {
        // attributes may precede the position keyword
        while !self.at_end() && !self.is_sym(',') && !self.is_sym(')') {
            if self.eat_kw("FIRST") {
                return Ok(ColumnPosition::First);
            }
            if self.eat_kw("AFTER") {
                return Ok(ColumnPosition::After(self.ident()?));
            }
            if self.is_sym('(') {
                self.skip_group()?;
            } else {
                self.pos += 1;
            }
        }
        Ok(ColumnPosition::Last)
    }

    /// `name type [attributes...]`, stopping before FIRST/AFTER and at the
    /// end of the item.
    fn column_def(&mut self) -> Result<ColumnDef> {
        let name = self.ident()?;
        let type_start = self
            .tokens
            .get(self.pos)
            .map(|t| t.start)
            .ok_or_else(|| self.error("expected column type"))?;

        // type name, optional argument group, sign modifiers
        let mut type_end = match self.peek() {
            Some(Tok::Word(_)) => {
                self.pos += 1;
                self.tokens[self.pos - 1].end
            }
            _ => return Err(self.error("expected column type")),
        };
        if self.eat_kw("PRECISION") || self.eat_kw("VARYING") {
            type_end = self.tokens[self.pos - 1].end;
        }
        if self.is_sym('(') {
            self.skip_group()?;
            type_end = self.tokens[self.pos - 1].end;
        }
        while self.is_kw("UNSIGNED") || self.is_kw("SIGNED") || self.is_kw("ZEROFILL") {
            type_end = self.tokens[self.pos].end;
            self.pos += 1;
        }
        let sql_type = SqlType::parse(&self.sql[type_start..type_end])?;
        let mut column = ColumnDef::new(name, sql_type);
        let mut explicit_null = false;

        while !self.at_end() && !self.is_sym(',') && !self.is_sym(')') {
            if self.is_kw("FIRST") || self.is_kw("AFTER") {
                break;
            }
            if self.eat_kws(&["NOT", "NULL"]) {
                column.nullable = false;
            } else if self.eat_kw("NULL") {
                column.nullable = true;
                explicit_null = true;
            } else if self.eat_kw("DEFAULT") {
                column.default = self.default_value()?;
            } else if self.eat_kws(&["PRIMARY", "KEY"]) {
                column.primary_key = true;
                if !explicit_null {
                    column.nullable = false;
                }
            } else if self.is_sym('(') {
                self.skip_group()?;
            } else {
                // COMMENT, COLLATE, AUTO_INCREMENT, ON UPDATE ... carry no layout
                self.pos += 1;
            }
        }
        Ok(column)
    }

    /// Default expression; `NULL` yields `None`.
    fn default_value(&mut self) -> Result<Option<String>> {
        let negative = self.eat_sym('-');
        let value = match self.peek().cloned() {
            Some(Tok::Str(s)) => {
                self.pos += 1;
                Some(s)
            }
            Some(Tok::Num(n)) => {
                self.pos += 1;
                Some(if negative { format!("-{}", n) } else { n })
            }
            Some(Tok::Word(w)) if w.eq_ignore_ascii_case("NULL") => {
                self.pos += 1;
                None
            }
            Some(Tok::Word(w)) => {
                self.pos += 1;
                if self.is_sym('(') {
                    let start = self.tokens[self.pos - 1].start;
                    self.skip_group()?;
                    let end = self.tokens[self.pos - 1].end;
                    Some(self.sql[start..end].to_string())
                } else {
                    Some(w)
                }
            }
            Some(Tok::Sym('(')) => {
                let start = self.tokens[self.pos].start;
                self.skip_group()?;
                let end = self.tokens[self.pos - 1].end;
                Some(self.sql[start..end].to_string())
            }
            _ => return Err(self.error("expected default value")),
        };
        Ok(value)
    }

    fn create_table(&mut self) -> Result<DdlStatement> {
        let table = self.table_ref()?;
        if self.eat_kw("LIKE") || !self.eat_sym('(') {
            // CREATE TABLE ... LIKE / AS SELECT carry no column list
            return Ok(DdlStatement::CreateTable {
                table,
                columns: Vec::new(),
            });
        }

        let mut columns: Vec<ColumnDef> = Vec::new();
        let mut key: Vec<String> = Vec::new();
        loop {
            if self.eat_kw("CONSTRAINT") && !self.is_kw("PRIMARY") && !self.is_kw("FOREIGN") {
                self.ident()?;
            }
            if self.eat_kws(&["PRIMARY", "KEY"]) {
                while self.is_kw("USING") {
                    self.pos += 2;
                }
                self.expect_sym('(')?;
                loop {
                    key.push(self.ident()?);
                    if self.is_sym('(') {
                        self.skip_group()?;
                    }
                    self.eat_kw("ASC");
                    self.eat_kw("DESC");
                    if !self.eat_sym(',') {
                        break;
                    }
                }
                self.expect_sym(')')?;
            } else if self.is_kw("INDEX")
                || self.is_kw("KEY")
                || self.is_kw("UNIQUE")
                || self.is_kw("FULLTEXT")
                || self.is_kw("SPATIAL")
                || self.is_kw("FOREIGN")
                || self.is_kw("CHECK")
            {
                // index definitions carry no columns of their own
            } else {
                columns.push(self.column_def()?);
            }
            self.skip_item()?;
            if !self.eat_sym(',') {
                break;
            }
        }
        self.expect_sym(')')?;

        for name in key {
            if let Some(c) = columns.iter_mut().find(|c| c.name.eq_ignore_ascii_case(&name)) {
                c.primary_key = true;
                c.nullable = false;
            }
        }
        Ok(DdlStatement::CreateTable { table, columns })
    }
}
