//! Recursive-descent parser for `CREATE TABLE`.
//!
//! Only the clauses the diff engine needs are modeled; recognized but
//! irrelevant table options are skipped, unknown syntax is a ParseError
//! with line/column. Statements other than CREATE TABLE are skipped by
//! `parse_statements`.

use common::err::osc_error::OscError;
use common::err::OResult;
use common::sql::{quote_ident, quote_string};
use tracing::debug;

use crate::lexer::{tokenize, Token, TokenKind};
use crate::model::{
    CheckDef, ColumnDef, DefaultValue, GeneratedDef, IndexColumn, IndexDef, IndexKind,
    PartitionDef, PartitionKind, PartitionSpec, SqlType, TableDef, TableOptions,
};

/// Parse exactly one CREATE TABLE statement.
pub fn parse_create_table(input: &str) -> OResult<TableDef> {
    let tables = parse_statements(input)?;
    match tables.into_iter().next() {
        Some(t) => Ok(t),
        None => Err(OscError::Parse {
            line: 1,
            column: 1,
            msg: String::from("no CREATE TABLE statement found"),
        }),
    }
}

/// Parse a whole input file. CREATE TABLE statements are returned in
/// order; anything else (DROP, INSERT, SET ...) is skipped.
pub fn parse_statements(input: &str) -> OResult<Vec<TableDef>> {
    let tokens = tokenize(input)?;
    let mut tables = Vec::new();

    for stmt in tokens.split(|t| t.is_symbol(';')) {
        if stmt.is_empty() {
            continue;
        }
        if stmt[0].is_word("create") && stmt.len() > 1 && stmt[1].is_word("table") {
            let mut parser = Parser {
                tokens: stmt,
                pos: 0,
            };
            tables.push(parser.create_table()?);
        } else {
            debug!("skipping non-CREATE-TABLE statement starting at line {}", stmt[0].line);
        }
    }

    Ok(tables)
}

/// Split an input file into statements, rendered back from tokens.
/// Used by direct mode, which runs the input as-is.
pub fn split_statements(input: &str) -> OResult<Vec<String>> {
    let tokens = tokenize(input)?;
    Ok(tokens
        .split(|t| t.is_symbol(';'))
        .filter(|stmt| !stmt.is_empty())
        .map(|stmt| {
            stmt.iter()
                .map(render_token)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect())
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn error(&self, msg: &str) -> OscError {
        let (line, column) = match self.peek().or_else(|| self.tokens.last()) {
            Some(t) => (t.line, t.col),
            None => (1, 1),
        };
        OscError::Parse {
            line,
            column,
            msg: msg.to_string(),
        }
    }

    fn accept_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(t) if t.is_word(word)) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_word(&mut self, word: &str) -> OResult<()> {
        if self.accept_word(word) {
            return Ok(());
        }
        Err(self.error(&format!("expected {}", word.to_uppercase())))
    }

    fn accept_symbol(&mut self, ch: char) -> bool {
        if matches!(self.peek(), Some(t) if t.is_symbol(ch)) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_symbol(&mut self, ch: char) -> OResult<()> {
        if self.accept_symbol(ch) {
            return Ok(());
        }
        Err(self.error(&format!("expected '{}'", ch)))
    }

    /// Identifier: bare word or backticked.
    fn ident(&mut self) -> OResult<String> {
        match self.peek() {
            Some(t) if t.kind == TokenKind::Word || t.kind == TokenKind::QuotedIdent => {
                let text = t.text.clone();
                self.pos += 1;
                Ok(text)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn word(&mut self) -> OResult<String> {
        match self.peek() {
            Some(t) if t.kind == TokenKind::Word => {
                let text = t.text.clone();
                self.pos += 1;
                Ok(text)
            }
            _ => Err(self.error("expected word")),
        }
    }

    fn number(&mut self) -> OResult<u64> {
        match self.peek() {
            Some(t) if t.kind == TokenKind::Number => {
                let parsed = t
                    .text
                    .parse::<u64>()
                    .map_err(|_| self.error("expected integer"));
                self.pos += 1;
                parsed
            }
            _ => Err(self.error("expected number")),
        }
    }

    fn string(&mut self) -> OResult<String> {
        match self.peek() {
            Some(t) if t.kind == TokenKind::Str => {
                let text = t.text.clone();
                self.pos += 1;
                Ok(text)
            }
            _ => Err(self.error("expected string literal")),
        }
    }

    /// Current token is '('; consume the balanced group and return the
    /// inner tokens rendered back to canonical text.
    fn capture_parens(&mut self) -> OResult<String> {
        self.expect_symbol('(')?;
        let mut depth = 1usize;
        let mut parts: Vec<String> = Vec::new();
        loop {
            let t = match self.bump() {
                Some(t) => t,
                None => return Err(self.error("unbalanced parenthesis")),
            };
            if t.is_symbol('(') {
                depth += 1;
            } else if t.is_symbol(')') {
                depth -= 1;
                if depth == 0 {
                    return Ok(parts.join(" "));
                }
            }
            parts.push(render_token(t));
        }
    }

    /// Skip tokens until the end of the current create-definition: a ','
    /// or the closing ')' at depth 0, which are left unconsumed.
    fn skip_to_def_end(&mut self) -> OResult<()> {
        let mut depth = 0usize;
        while let Some(t) = self.peek() {
            if depth == 0 && (t.is_symbol(',') || t.is_symbol(')')) {
                return Ok(());
            }
            if t.is_symbol('(') {
                depth += 1;
            } else if t.is_symbol(')') {
                depth -= 1;
            }
            self.pos += 1;
        }
        Err(self.error("unexpected end of definition"))
    }

    fn create_table(&mut self) -> OResult<TableDef> {
        self.expect_word("create")?;
        self.accept_word("temporary");
        self.expect_word("table")?;
        if self.accept_word("if") {
            self.expect_word("not")?;
            self.expect_word("exists")?;
        }

        let mut name = self.ident()?;
        // db.table 形式只保留表名
        if self.accept_symbol('.') {
            name = self.ident()?;
        }

        let mut table = TableDef {
            name,
            columns: Vec::new(),
            indexes: Vec::new(),
            checks: Vec::new(),
            foreign_keys: Vec::new(),
            partition: None,
            options: TableOptions::default(),
        };

        self.expect_symbol('(')?;
        loop {
            self.create_definition(&mut table)?;
            if self.accept_symbol(',') {
                continue;
            }
            self.expect_symbol(')')?;
            break;
        }

        self.table_options(&mut table)?;

        if self.accept_word("partition") {
            self.expect_word("by")?;
            table.partition = Some(self.partition_def()?);
        }

        if let Some(t) = self.peek() {
            return Err(OscError::Parse {
                line: t.line,
                column: t.col,
                msg: format!("unexpected trailing token '{}'", t.text),
            });
        }

        Ok(table)
    }

    fn create_definition(&mut self, table: &mut TableDef) -> OResult<()> {
        if self.accept_word("primary") {
            self.expect_word("key")?;
            let columns = self.key_parts()?;
            self.skip_to_def_end()?;
            table.indexes.push(IndexDef {
                name: String::from("PRIMARY"),
                kind: IndexKind::Primary,
                columns,
            });
            return Ok(());
        }

        if self.accept_word("unique") {
            return self.named_index(table, IndexKind::Unique);
        }
        if self.accept_word("fulltext") {
            return self.named_index(table, IndexKind::Fulltext);
        }
        if self.accept_word("spatial") {
            return self.named_index(table, IndexKind::Spatial);
        }
        if matches!(self.peek(), Some(t) if t.is_word("key") || t.is_word("index")) {
            self.pos += 1;
            let name = self.ident()?;
            let columns = self.key_parts()?;
            self.skip_to_def_end()?;
            table.indexes.push(IndexDef {
                name,
                kind: IndexKind::NonUnique,
                columns,
            });
            return Ok(());
        }

        if self.accept_word("constraint") {
            // optional symbol name before the real definition
            let symbol = if matches!(self.peek(), Some(t) if !t.is_word("primary")
                && !t.is_word("unique")
                && !t.is_word("foreign")
                && !t.is_word("check"))
            {
                Some(self.ident()?)
            } else {
                None
            };

            if self.accept_word("primary") {
                self.expect_word("key")?;
                let columns = self.key_parts()?;
                self.skip_to_def_end()?;
                table.indexes.push(IndexDef {
                    name: String::from("PRIMARY"),
                    kind: IndexKind::Primary,
                    columns,
                });
                return Ok(());
            }
            if self.accept_word("unique") {
                self.accept_word("key");
                self.accept_word("index");
                let name = match self.peek() {
                    Some(t) if t.is_symbol('(') => {
                        symbol.clone().unwrap_or_default()
                    }
                    _ => self.ident()?,
                };
                let columns = self.key_parts()?;
                self.skip_to_def_end()?;
                let name = if name.is_empty() {
                    columns[0].name.clone()
                } else {
                    name
                };
                table.indexes.push(IndexDef {
                    name,
                    kind: IndexKind::Unique,
                    columns,
                });
                return Ok(());
            }
            if self.accept_word("foreign") {
                self.expect_word("key")?;
                let start = self.pos;
                self.skip_to_def_end()?;
                let raw = self.tokens[start..self.pos]
                    .iter()
                    .map(render_token)
                    .collect::<Vec<_>>()
                    .join(" ");
                table
                    .foreign_keys
                    .push(format!("FOREIGN KEY {}", raw));
                return Ok(());
            }
            if self.accept_word("check") {
                let expr = self.capture_parens()?;
                self.skip_to_def_end()?;
                table.checks.push(CheckDef { name: symbol, expr });
                return Ok(());
            }
            return Err(self.error("unsupported constraint"));
        }

        if self.accept_word("foreign") {
            self.expect_word("key")?;
            let start = self.pos;
            self.skip_to_def_end()?;
            let raw = self.tokens[start..self.pos]
                .iter()
                .map(render_token)
                .collect::<Vec<_>>()
                .join(" ");
            table.foreign_keys.push(format!("FOREIGN KEY {}", raw));
            return Ok(());
        }

        if self.accept_word("check") {
            let expr = self.capture_parens()?;
            self.skip_to_def_end()?;
            table.checks.push(CheckDef { name: None, expr });
            return Ok(());
        }

        let column = self.column_definition(table)?;
        table.columns.push(column);
        Ok(())
    }

    fn named_index(&mut self, table: &mut TableDef, kind: IndexKind) -> OResult<()> {
        self.accept_word("key");
        self.accept_word("index");
        let name = match self.peek() {
            Some(t) if t.is_symbol('(') => None,
            _ => Some(self.ident()?),
        };
        let columns = self.key_parts()?;
        self.skip_to_def_end()?;
        let name = name.unwrap_or_else(|| columns[0].name.clone());
        table.indexes.push(IndexDef {
            name,
            kind,
            columns,
        });
        Ok(())
    }

    fn key_parts(&mut self) -> OResult<Vec<IndexColumn>> {
        self.expect_symbol('(')?;
        let mut parts = Vec::new();
        loop {
            let name = self.ident()?;
            let prefix = if self.accept_symbol('(') {
                let n = self.number()? as u32;
                self.expect_symbol(')')?;
                Some(n)
            } else {
                None
            };
            self.accept_word("asc");
            self.accept_word("desc");
            parts.push(IndexColumn { name, prefix });

            if self.accept_symbol(',') {
                continue;
            }
            self.expect_symbol(')')?;
            break;
        }
        if parts.is_empty() {
            return Err(self.error("empty key definition"));
        }
        Ok(parts)
    }

    fn column_definition(&mut self, table: &mut TableDef) -> OResult<ColumnDef> {
        let name = self.ident()?;
        let mut sql_type = SqlType::new(&self.word()?);

        // (len[,scale]) 或 enum/set 取值列表
        if matches!(self.peek(), Some(t) if t.is_symbol('(')) {
            if sql_type.base == "enum" || sql_type.base == "set" {
                self.expect_symbol('(')?;
                loop {
                    sql_type.value_list.push(self.string()?);
                    if self.accept_symbol(',') {
                        continue;
                    }
                    self.expect_symbol(')')?;
                    break;
                }
            } else {
                self.expect_symbol('(')?;
                sql_type.length = Some(self.number()? as u32);
                if self.accept_symbol(',') {
                    sql_type.scale = Some(self.number()? as u32);
                }
                self.expect_symbol(')')?;
            }
        }

        let mut column = ColumnDef {
            name,
            sql_type,
            nullable: true,
            default: None,
            charset: None,
            collation: None,
            auto_increment: false,
            on_update_current_ts: false,
            generated: None,
            comment: None,
        };

        loop {
            match self.peek() {
                None => break,
                Some(t) if t.is_symbol(',') || t.is_symbol(')') => break,
                _ => {}
            }

            if self.accept_word("unsigned") {
                column.sql_type.unsigned = true;
            } else if self.accept_word("zerofill") {
                column.sql_type.zerofill = true;
            } else if self.accept_word("binary") {
                // text 类型的 binary 属性等价于 _bin collation, 原样忽略
            } else if self.accept_word("not") {
                self.expect_word("null")?;
                column.nullable = false;
            } else if self.accept_word("null") {
                column.nullable = true;
            } else if self.accept_word("default") {
                column.default = Some(self.default_value()?);
            } else if self.accept_word("auto_increment") {
                column.auto_increment = true;
            } else if self.accept_word("unique") {
                self.accept_word("key");
                table.indexes.push(IndexDef {
                    name: column.name.clone(),
                    kind: IndexKind::Unique,
                    columns: vec![IndexColumn {
                        name: column.name.clone(),
                        prefix: None,
                    }],
                });
            } else if self.accept_word("primary") {
                self.expect_word("key")?;
                table.indexes.push(IndexDef {
                    name: String::from("PRIMARY"),
                    kind: IndexKind::Primary,
                    columns: vec![IndexColumn {
                        name: column.name.clone(),
                        prefix: None,
                    }],
                });
            } else if self.accept_word("key") {
                table.indexes.push(IndexDef {
                    name: column.name.clone(),
                    kind: IndexKind::NonUnique,
                    columns: vec![IndexColumn {
                        name: column.name.clone(),
                        prefix: None,
                    }],
                });
            } else if self.accept_word("comment") {
                column.comment = Some(self.string()?);
            } else if self.accept_word("collate") {
                column.collation = Some(self.word()?);
            } else if self.accept_word("character") {
                self.expect_word("set")?;
                column.charset = Some(self.word()?);
            } else if self.accept_word("charset") {
                column.charset = Some(self.word()?);
            } else if self.accept_word("on") {
                self.expect_word("update")?;
                self.expect_word("current_timestamp")?;
                if matches!(self.peek(), Some(t) if t.is_symbol('(')) {
                    self.capture_parens()?;
                }
                column.on_update_current_ts = true;
            } else if self.accept_word("generated") {
                self.expect_word("always")?;
                self.expect_word("as")?;
                let expr = self.capture_parens()?;
                let stored = self.accept_word("stored");
                if !stored {
                    self.accept_word("virtual");
                }
                column.generated = Some(GeneratedDef { expr, stored });
            } else if self.accept_word("as") {
                let expr = self.capture_parens()?;
                let stored = self.accept_word("stored");
                if !stored {
                    self.accept_word("virtual");
                }
                column.generated = Some(GeneratedDef { expr, stored });
            } else if self.accept_word("check") {
                let expr = self.capture_parens()?;
                table.checks.push(CheckDef { name: None, expr });
            } else if self.accept_word("column_format") || self.accept_word("storage") {
                self.word()?;
            } else {
                let text = self.peek().map(|t| t.text.clone()).unwrap_or_default();
                return Err(self.error(&format!("unexpected token '{}'", text)));
            }
        }

        Ok(column)
    }

    fn default_value(&mut self) -> OResult<DefaultValue> {
        if self.accept_word("null") {
            return Ok(DefaultValue::Null);
        }
        if self.accept_word("true") {
            return Ok(DefaultValue::Literal(String::from("1")));
        }
        if self.accept_word("false") {
            return Ok(DefaultValue::Literal(String::from("0")));
        }

        let t = match self.peek() {
            Some(t) => t.clone(),
            None => return Err(self.error("expected default value")),
        };

        match t.kind {
            TokenKind::Str => {
                self.pos += 1;
                // b'0101' / x'ff' 形式由上一个 word 分支处理
                Ok(DefaultValue::Literal(t.text))
            }
            TokenKind::Number => {
                self.pos += 1;
                Ok(DefaultValue::Literal(t.text))
            }
            TokenKind::Symbol if t.is_symbol('-') => {
                self.pos += 1;
                let n = match self.peek() {
                    Some(t) if t.kind == TokenKind::Number => {
                        let text = t.text.clone();
                        self.pos += 1;
                        text
                    }
                    _ => return Err(self.error("expected number after '-'")),
                };
                Ok(DefaultValue::Literal(format!("-{}", n)))
            }
            TokenKind::Symbol if t.is_symbol('(') => {
                let expr = self.capture_parens()?;
                Ok(DefaultValue::Expr(format!("({})", expr)))
            }
            TokenKind::Word => {
                self.pos += 1;
                let upper = t.text.to_ascii_uppercase();
                // b'…' / x'…' literals
                if (upper == "B" || upper == "X")
                    && matches!(self.peek(), Some(n) if n.kind == TokenKind::Str)
                {
                    let body = self.string()?;
                    return Ok(DefaultValue::Expr(format!(
                        "{}{}",
                        t.text.to_ascii_lowercase(),
                        quote_string(&body)
                    )));
                }
                if matches!(self.peek(), Some(n) if n.is_symbol('(')) {
                    let args = self.capture_parens()?;
                    if args.is_empty() {
                        return Ok(DefaultValue::Expr(upper));
                    }
                    return Ok(DefaultValue::Expr(format!("{}({})", upper, args)));
                }
                Ok(DefaultValue::Expr(upper))
            }
            _ => Err(self.error("unsupported default value")),
        }
    }

    fn table_options(&mut self, table: &mut TableDef) -> OResult<()> {
        loop {
            let (at_partition, at_word, text) = match self.peek() {
                Some(t) => (t.is_word("partition"), t.kind == TokenKind::Word, t.text.clone()),
                None => return Ok(()),
            };
            if at_partition {
                return Ok(());
            }

            if self.accept_word("engine") {
                self.accept_symbol('=');
                table.options.engine = Some(self.word()?);
            } else if self.accept_word("auto_increment") {
                self.accept_symbol('=');
                table.options.auto_increment = Some(self.number()?);
            } else if self.accept_word("default") {
                // DEFAULT CHARSET / DEFAULT CHARACTER SET / DEFAULT COLLATE
                if self.accept_word("charset") {
                    self.accept_symbol('=');
                    table.options.charset = Some(self.word()?);
                } else if self.accept_word("character") {
                    self.expect_word("set")?;
                    self.accept_symbol('=');
                    table.options.charset = Some(self.word()?);
                } else if self.accept_word("collate") {
                    self.accept_symbol('=');
                    table.options.collation = Some(self.word()?);
                } else {
                    return Err(self.error("unexpected DEFAULT table option"));
                }
            } else if self.accept_word("charset") {
                self.accept_symbol('=');
                table.options.charset = Some(self.word()?);
            } else if self.accept_word("character") {
                self.expect_word("set")?;
                self.accept_symbol('=');
                table.options.charset = Some(self.word()?);
            } else if self.accept_word("collate") {
                self.accept_symbol('=');
                table.options.collation = Some(self.word()?);
            } else if self.accept_word("row_format") {
                self.accept_symbol('=');
                table.options.row_format = Some(self.word()?);
            } else if self.accept_word("comment") {
                self.accept_symbol('=');
                table.options.comment = Some(self.string()?);
            } else if at_word {
                // 其他 name [=] value 形式的表选项统一跳过
                self.pos += 1;
                self.accept_symbol('=');
                match self.peek() {
                    Some(v)
                        if v.kind == TokenKind::Word
                            || v.kind == TokenKind::Number
                            || v.kind == TokenKind::Str =>
                    {
                        self.pos += 1;
                    }
                    _ => return Err(self.error("expected table option value")),
                }
            } else {
                return Err(self.error(&format!("unexpected token '{}'", text)));
            }
        }
    }

    fn partition_def(&mut self) -> OResult<PartitionDef> {
        self.accept_word("linear");

        let (kind, columns_variant, expr) = if self.accept_word("hash") {
            (PartitionKind::Hash, false, self.capture_parens()?)
        } else if self.accept_word("key") {
            (PartitionKind::Key, false, self.capture_parens()?)
        } else if self.accept_word("range") {
            let columns = self.accept_word("columns");
            (PartitionKind::Range, columns, self.capture_parens()?)
        } else if self.accept_word("list") {
            let columns = self.accept_word("columns");
            (PartitionKind::List, columns, self.capture_parens()?)
        } else {
            return Err(self.error("unsupported partition type"));
        };

        let mut def = PartitionDef {
            kind,
            expr,
            columns_variant,
            count: None,
            partitions: Vec::new(),
        };

        if self.accept_word("partitions") {
            def.count = Some(self.number()? as u32);
        }

        if self.accept_symbol('(') {
            loop {
                self.expect_word("partition")?;
                let name = self.ident()?;
                let mut values = None;
                if self.accept_word("values") {
                    if self.accept_word("less") {
                        self.expect_word("than")?;
                        if self.accept_word("maxvalue") {
                            values = Some(String::from("VALUES LESS THAN MAXVALUE"));
                        } else {
                            let inner = self.capture_parens()?;
                            values = Some(format!("VALUES LESS THAN ({})", inner));
                        }
                    } else if self.accept_word("in") {
                        let inner = self.capture_parens()?;
                        values = Some(format!("VALUES IN ({})", inner));
                    } else {
                        return Err(self.error("expected LESS THAN or IN"));
                    }
                }

                let mut engine = None;
                loop {
                    if self.accept_word("engine") {
                        self.accept_symbol('=');
                        engine = Some(self.word()?);
                    } else if self.accept_word("comment") {
                        self.accept_symbol('=');
                        self.string()?;
                    } else {
                        break;
                    }
                }

                def.partitions.push(PartitionSpec {
                    name,
                    values,
                    engine,
                });

                if self.accept_symbol(',') {
                    continue;
                }
                self.expect_symbol(')')?;
                break;
            }
        }

        Ok(def)
    }
}

fn render_token(t: &Token) -> String {
    match t.kind {
        TokenKind::Str => quote_string(&t.text),
        TokenKind::QuotedIdent => quote_ident(&t.text),
        _ => t.text.clone(),
    }
}
