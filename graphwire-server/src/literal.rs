//! A small reference query engine.
//!
//! Understands a tiny Cypher subset, enough to drive every protocol path:
//!
//! ```text
//! [UNWIND <expr> AS <name>] RETURN <expr> [AS <alias>] (, <expr> [AS <alias>])* [;]
//! ```
//!
//! Expressions are literals (integer, float, string, boolean, null, list),
//! `$param` references, the UNWIND variable and `range(a, b[, step])`.
//! Rows are produced on a spawned task; the cancellation token is checked
//! before every row.

use crate::engine::{
    EngineError, Query, QueryEngine, ResultStream, StreamEvent, TxId, BOOKMARK_KEY,
    RESULT_CHANNEL_CAPACITY,
};
use graphwire_protocol::{Status, TxMetadata, Value, ValueMap};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Engine status codes that have no counterpart in [`Status`].
pub mod codes {
    pub const ARGUMENT_ERROR: &str = "Neo.ClientError.Statement.ArgumentError";
    pub const TX_TIMED_OUT: &str = "Neo.ClientError.Transaction.TransactionTimedOut";
    pub const INVALID_BOOKMARK: &str = "Neo.ClientError.Transaction.InvalidBookmark";
}

/// Prefix of every bookmark handed out; the suffix is the commit sequence.
pub const BOOKMARK_PREFIX: &str = "graphwire:bookmark:v1:tx";

/// Longest list `range()` may build outside of UNWIND.
const MAX_RANGE_LIST: i64 = 1_000_000;

#[derive(Debug)]
struct OpenTx {
    started: Instant,
    timeout: Option<Duration>,
}

impl OpenTx {
    fn expired(&self) -> bool {
        self.timeout.is_some_and(|t| self.started.elapsed() > t)
    }
}

/// In-memory engine evaluating literal RETURN statements.
#[derive(Debug, Clone, Default)]
pub struct LiteralEngine {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    transactions: Mutex<HashMap<TxId, OpenTx>>,
    next_tx: AtomicU64,
    last_commit: AtomicU64,
}

impl LiteralEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions begun and not yet finished.
    pub fn open_transactions(&self) -> usize {
        self.inner.transactions.lock().len()
    }

    fn next_bookmark(&self) -> String {
        let seq = self.inner.last_commit.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}{}", BOOKMARK_PREFIX, seq)
    }

    fn check_bookmarks(&self, bookmarks: &[String]) -> Result<(), EngineError> {
        let last = self.inner.last_commit.load(Ordering::SeqCst);
        for bookmark in bookmarks {
            let seq = bookmark
                .strip_prefix(BOOKMARK_PREFIX)
                .and_then(|s| s.parse::<u64>().ok());
            match seq {
                Some(seq) if seq <= last => {}
                _ => {
                    return Err(EngineError::new(
                        codes::INVALID_BOOKMARK,
                        format!("'{}' is not a valid bookmark", bookmark),
                    ))
                }
            }
        }
        Ok(())
    }

    fn timed_out(tx: TxId) -> EngineError {
        EngineError::new(
            codes::TX_TIMED_OUT,
            format!("transaction {} exceeded its timeout and was rolled back", tx),
        )
    }

    fn not_found(tx: TxId) -> EngineError {
        EngineError::from_status(
            Status::TransactionNotFound,
            format!("transaction {} does not exist", tx),
        )
    }

    /// Checks `tx` is open, dropping it when its timeout has passed.
    fn ensure_live(&self, tx: TxId) -> Result<(), EngineError> {
        let mut transactions = self.inner.transactions.lock();
        match transactions.get(&tx) {
            None => Err(Self::not_found(tx)),
            Some(open) if open.expired() => {
                transactions.remove(&tx);
                Err(Self::timed_out(tx))
            }
            Some(_) => Ok(()),
        }
    }
}

impl QueryEngine for LiteralEngine {
    fn execute(
        &self,
        query: Query,
        tx: Option<TxId>,
        cancel: CancellationToken,
    ) -> Result<ResultStream, EngineError> {
        match tx {
            Some(tx) => self.ensure_live(tx)?,
            None => self.check_bookmarks(&query.metadata.bookmarks)?,
        }

        let plan = Plan::parse(&query.statement)?;
        plan.check_parameters(&query.parameters)?;

        let fields = plan.columns();
        let (sender, receiver) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let bookmark = tx.is_none().then(|| self.next_bookmark());
        let deadline = match tx {
            None => query.metadata.tx_timeout.map(|t| Instant::now() + t),
            Some(_) => None,
        };

        tokio::spawn(produce(
            plan,
            query.parameters,
            sender,
            cancel,
            deadline,
            bookmark,
        ));

        Ok(ResultStream::new(fields, receiver))
    }

    fn begin(&self, metadata: &TxMetadata) -> Result<TxId, EngineError> {
        self.check_bookmarks(&metadata.bookmarks)?;
        let id = TxId(self.inner.next_tx.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner.transactions.lock().insert(
            id,
            OpenTx {
                started: Instant::now(),
                timeout: metadata.tx_timeout,
            },
        );
        tracing::debug!("Began transaction {}", id);
        Ok(id)
    }

    fn commit(&self, tx: TxId) -> Result<String, EngineError> {
        let open = self
            .inner
            .transactions
            .lock()
            .remove(&tx)
            .ok_or_else(|| Self::not_found(tx))?;
        if open.expired() {
            return Err(Self::timed_out(tx));
        }
        let bookmark = self.next_bookmark();
        tracing::debug!("Committed transaction {} as {}", tx, bookmark);
        Ok(bookmark)
    }

    fn rollback(&self, tx: TxId) -> Result<(), EngineError> {
        self.inner
            .transactions
            .lock()
            .remove(&tx)
            .map(|_| tracing::debug!("Rolled back transaction {}", tx))
            .ok_or_else(|| Self::not_found(tx))
    }
}

async fn produce(
    plan: Plan,
    params: ValueMap,
    sender: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    bookmark: Option<String>,
) {
    let rows = match plan.rows(&params) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = sender.send(StreamEvent::Failed(e)).await;
            return;
        }
    };

    for binding in rows {
        if deadline.is_some_and(|d| Instant::now() > d) {
            let err = EngineError::new(codes::TX_TIMED_OUT, "query exceeded its timeout");
            let _ = sender.send(StreamEvent::Failed(err)).await;
            return;
        }

        let event = match plan.project(&params, binding.as_ref()) {
            Ok(record) => StreamEvent::Record(record),
            Err(e) => StreamEvent::Failed(e),
        };
        let failed = matches!(event, StreamEvent::Failed(_));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = sender.send(event) => {
                if sent.is_err() || failed {
                    return;
                }
            }
        }
    }

    let mut summary = ValueMap::new();
    if let Some(bookmark) = bookmark {
        summary.insert(BOOKMARK_KEY, bookmark);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = sender.send(StreamEvent::Done(summary)) => {}
    }
}


#[derive(Debug, Clone, PartialEq)]
struct Plan {
    unwind: Option<(Expr, String)>,
    items: Vec<(Expr, String)>,
}

/// Values bound to the UNWIND variable, one per row.
enum Rows {
    Once,
    Range { next: i64, end: i64, step: i64, done: bool },
    Items(std::vec::IntoIter<Value>),
}

impl Iterator for Rows {
    type Item = Option<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Rows::Once => {
                *self = Rows::Items(Vec::new().into_iter());
                Some(None)
            }
            Rows::Range {
                next,
                end,
                step,
                done,
            } => {
                let in_range = if *step > 0 { *next <= *end } else { *next >= *end };
                if *done || !in_range {
                    return None;
                }
                let current = *next;
                match next.checked_add(*step) {
                    Some(n) => *next = n,
                    None => *done = true,
                }
                Some(Some(Value::Integer(current)))
            }
            Rows::Items(items) => items.next().map(Some),
        }
    }
}

impl Plan {
    fn parse(statement: &str) -> Result<Self, EngineError> {
        let mut parser = Parser {
            src: statement,
            tokens: tokenize(statement)?,
            pos: 0,
        };

        let unwind = if parser.eat_keyword("UNWIND") {
            let expr = parser.expr()?;
            parser.expect_keyword("AS")?;
            Some((expr, parser.ident()?))
        } else {
            None
        };

        parser.expect_keyword("RETURN")?;
        let mut items = Vec::new();
        loop {
            let start = parser.start_offset();
            let expr = parser.expr()?;
            let text = parser.src[start..parser.end_offset()].trim().to_string();
            let name = if parser.eat_keyword("AS") {
                parser.ident()?
            } else {
                text
            };
            items.push((expr, name));
            if !parser.eat_sym(',') {
                break;
            }
        }
        parser.eat_sym(';');
        if let Some(token) = parser.peek() {
            return Err(syntax(format!(
                "Invalid input '{}': expected end of statement",
                &parser.src[token.start..token.end]
            )));
        }

        let bound = unwind.as_ref().map(|(_, name)| name.as_str());
        for (expr, _) in &items {
            expr.check_variables(bound)?;
        }
        if let Some((expr, _)) = &unwind {
            expr.check_variables(None)?;
        }
        Ok(Plan { unwind, items })
    }

    fn columns(&self) -> Vec<String> {
        self.items.iter().map(|(_, name)| name.clone()).collect()
    }

    fn check_parameters(&self, params: &ValueMap) -> Result<(), EngineError> {
        let mut names = Vec::new();
        let exprs = self.unwind.iter().chain(&self.items).map(|(expr, _)| expr);
        for expr in exprs {
            expr.collect_params(&mut names);
        }
        let mut missing: Vec<&str> = names
            .into_iter()
            .filter(|name| !params.contains_key(name))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if missing.is_empty() {
            return Ok(());
        }
        Err(EngineError::from_status(
            Status::ParameterMissing,
            format!("Expected parameter(s): {}", missing.join(", ")),
        ))
    }

    fn rows(&self, params: &ValueMap) -> Result<Rows, EngineError> {
        let Some((expr, _)) = &self.unwind else {
            return Ok(Rows::Once);
        };
        let scope = Scope { params, var: None };
        if let Expr::Range(args) = expr {
            let (start, end, step) = range_bounds(args, &scope)?;
            return Ok(Rows::Range {
                next: start,
                end,
                step,
                done: false,
            });
        }
        Ok(match expr.eval(&scope)? {
            Value::Null => Rows::Items(Vec::new().into_iter()),
            Value::List(items) => Rows::Items(items.into_iter()),
            other => Rows::Items(vec![other].into_iter()),
        })
    }

    fn project(&self, params: &ValueMap, binding: Option<&Value>) -> Result<Vec<Value>, EngineError> {
        let var = match (&self.unwind, binding) {
            (Some((_, name)), Some(value)) => Some((name.as_str(), value)),
            _ => None,
        };
        let scope = Scope { params, var };
        self.items.iter().map(|(expr, _)| expr.eval(&scope)).collect()
    }
}

fn syntax(message: impl Into<String>) -> EngineError {
    EngineError::from_status(Status::SyntaxError, message)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Param(String),
    Variable(String),
    List(Vec<Expr>),
    Range(Vec<Expr>),
}

struct Scope<'a> {
    params: &'a ValueMap,
    var: Option<(&'a str, &'a Value)>,
}

impl Expr {
    fn check_variables(&self, bound: Option<&str>) -> Result<(), EngineError> {
        match self {
            Expr::Variable(name) if Some(name.as_str()) != bound => {
                Err(syntax(format!("Variable `{}` not defined", name)))
            }
            Expr::List(items) | Expr::Range(items) => {
                items.iter().try_for_each(|e| e.check_variables(bound))
            }
            _ => Ok(()),
        }
    }

    fn collect_params<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Param(name) => out.push(name),
            Expr::List(items) | Expr::Range(items) => {
                items.iter().for_each(|e| e.collect_params(out))
            }
            Expr::Literal(_) | Expr::Variable(_) => {}
        }
    }

    fn eval(&self, scope: &Scope<'_>) -> Result<Value, EngineError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Param(name) => scope.params.get(name).cloned().ok_or_else(|| {
                EngineError::from_status(
                    Status::ParameterMissing,
                    format!("Expected parameter(s): {}", name),
                )
            }),
            Expr::Variable(name) => match scope.var {
                Some((bound, value)) if bound == name => Ok(value.clone()),
                _ => Err(syntax(format!("Variable `{}` not defined", name))),
            },
            Expr::List(items) => items
                .iter()
                .map(|e| e.eval(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Range(args) => {
                let (start, end, step) = range_bounds(args, scope)?;
                let len = if (step > 0 && start > end) || (step < 0 && start < end) {
                    0
                } else {
                    (end as i128 - start as i128) / step as i128 + 1
                };
                if len > MAX_RANGE_LIST as i128 {
                    return Err(EngineError::new(
                        codes::ARGUMENT_ERROR,
                        format!("range() of {} elements is too large to build", len),
                    ));
                }
                let items = Rows::Range {
                    next: start,
                    end,
                    step,
                    done: false,
                }
                .flatten()
                .collect();
                Ok(Value::List(items))
            }
        }
    }
}

fn range_bounds(args: &[Expr], scope: &Scope<'_>) -> Result<(i64, i64, i64), EngineError> {
    let mut ints = Vec::with_capacity(args.len());
    for arg in args {
        match arg.eval(scope)? {
            Value::Integer(i) => ints.push(i),
            other => {
                return Err(EngineError::from_status(
                    Status::TypeError,
                    format!("range() expects integers, got {}", other.type_name()),
                ))
            }
        }
    }
    match ints[..] {
        [start, end] => Ok((start, end, 1)),
        [_, _, 0] => Err(EngineError::new(
            codes::ARGUMENT_ERROR,
            "step argument to range() cannot be zero",
        )),
        [start, end, step] => Ok((start, end, step)),
        _ => Err(syntax("range() takes 2 or 3 arguments")),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Param(String),
    Sym(char),
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    start: usize,
    end: usize,
}

const SYMBOLS: &str = "()[],;-";

fn tokenize(src: &str) -> Result<Vec<Spanned>, EngineError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let offset = |i: usize| chars.get(i).map_or(src.len(), |(o, _)| *o);
    let at = |i: usize| chars.get(i).map(|(_, c)| *c);
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let digits = |mut i: usize| {
        while at(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        i
    };

    let mut out = Vec::new();
    let mut i = 0;
    while let Some(c) = at(i) {
        let start = i;
        let token = if c.is_whitespace() {
            i += 1;
            continue;
        } else if c.is_ascii_digit() {
            i = digits(i);
            let is_float = at(i) == Some('.') && at(i + 1).is_some_and(|c| c.is_ascii_digit());
            if is_float {
                i = digits(i + 1);
            }
            let text = &src[offset(start)..offset(i)];
            if is_float {
                Token::Float(
                    text.parse()
                        .map_err(|_| syntax(format!("invalid float literal: {}", text)))?,
                )
            } else {
                Token::Int(
                    text.parse()
                        .map_err(|_| syntax(format!("integer is too large: {}", text)))?,
                )
            }
        } else if c == '\'' || c == '"' {
            i += 1;
            let mut value = String::new();
            loop {
                match at(i) {
                    None => return Err(syntax("unterminated string literal")),
                    Some(q) if q == c => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = match at(i + 1) {
                            Some('n') => '\n',
                            Some('t') => '\t',
                            Some(e @ ('\\' | '\'' | '"')) => e,
                            _ => return Err(syntax("invalid escape sequence in string literal")),
                        };
                        value.push(escaped);
                        i += 2;
                    }
                    Some(other) => {
                        value.push(other);
                        i += 1;
                    }
                }
            }
            Token::Str(value)
        } else if c == '$' || c.is_alphabetic() || c == '_' {
            let name_start = if c == '$' { i + 1 } else { i };
            i = name_start;
            while at(i).is_some_and(is_word) {
                i += 1;
            }
            let name = src[offset(name_start)..offset(i)].to_string();
            match c {
                '$' if name.is_empty() => {
                    return Err(syntax("expected a parameter name after '$'"))
                }
                '$' => Token::Param(name),
                _ => Token::Ident(name),
            }
        } else if SYMBOLS.contains(c) {
            i += 1;
            Token::Sym(c)
        } else {
            return Err(syntax(format!("Invalid input '{}'", c)));
        };
        out.push(Spanned {
            token,
            start: offset(start),
            end: offset(i),
        });
    }
    Ok(out)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn start_offset(&self) -> usize {
        self.peek().map_or(self.src.len(), |t| t.start)
    }

    fn end_offset(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(0, |t| t.end)
    }

    fn unexpected(&self, expected: &str) -> EngineError {
        match self.peek() {
            Some(t) => syntax(format!(
                "Invalid input '{}': expected {}",
                &self.src[t.start..t.end],
                expected
            )),
            None => syntax(format!("Unexpected end of input: expected {}", expected)),
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = matches!(self.peek(), Some(Spanned { token: Token::Ident(w), .. }) if w.eq_ignore_ascii_case(keyword));
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), EngineError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn eat_sym(&mut self, sym: char) -> bool {
        let found = matches!(self.peek(), Some(Spanned { token: Token::Sym(c), .. }) if *c == sym);
        if found {
            self.pos += 1;
        }
        found
    }

    fn ident(&mut self) -> Result<String, EngineError> {
        match self.peek() {
            Some(Spanned {
                token: Token::Ident(name),
                ..
            }) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn expr(&mut self) -> Result<Expr, EngineError> {
        if self.eat_sym('[') {
            return Ok(Expr::List(self.list_until(']')?));
        }

        let negative = self.eat_sym('-');
        let Some(token) = self.peek().map(|t| t.token.clone()) else {
            return Err(self.unexpected("an expression"));
        };
        let expr = match token {
            Token::Int(i) if negative => Expr::Literal(Value::Integer(-i)),
            Token::Float(f) if negative => Expr::Literal(Value::Float(-f)),
            _ if negative => return Err(self.unexpected("a number")),
            Token::Int(i) => Expr::Literal(Value::Integer(i)),
            Token::Float(f) => Expr::Literal(Value::Float(f)),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Param(name) => Expr::Param(name),
            Token::Ident(word) => {
                self.pos += 1;
                return self.word(word);
            }
            Token::Sym(_) => return Err(self.unexpected("an expression")),
        };
        self.pos += 1;
        Ok(expr)
    }

    fn word(&mut self, word: String) -> Result<Expr, EngineError> {
        if self.eat_sym('(') {
            if !word.eq_ignore_ascii_case("range") {
                return Err(syntax(format!("Unknown function '{}'", word)));
            }
            return Ok(Expr::Range(self.list_until(')')?));
        }
        Ok(match word.to_ascii_lowercase().as_str() {
            "null" => Expr::Literal(Value::Null),
            "true" => Expr::Literal(Value::Boolean(true)),
            "false" => Expr::Literal(Value::Boolean(false)),
            _ => Expr::Variable(word),
        })
    }

    fn list_until(&mut self, close: char) -> Result<Vec<Expr>, EngineError> {
        let mut items = Vec::new();
        if self.eat_sym(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.eat_sym(close) {
                return Ok(items);
            }
            if !self.eat_sym(',') {
                return Err(self.unexpected(&format!("',' or '{}'", close)));
            }
        }
    }
}
