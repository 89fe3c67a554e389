//! A PromQL-style query parser producing [`LogicalPlan`]s.
//!
//! Hand-written recursive descent with precedence climbing. Selectors bind
//! to the caller's [`TimeStepParams`]: a bare selector becomes a
//! `PeriodicSeries`, a range-function call over `sel[window]` becomes a
//! `PeriodicSeriesWithWindowing`.

use crate::logical::{
    AggregationOperator, BinaryOperator, Cardinality, Grouping, InstantFunction, LogicalPlan,
    MiscFunction, RangeFunction, SetOperator, StepRange,
};
use crate::{BadQuerySnafu, Result};
use data_types::{ColumnFilter, FilterOp, TimeRange};

/// The stepping a query is evaluated at, epoch ms.
#[derive(Debug, Clone, Copy)]
pub struct TimeStepParams {
    /// First step.
    pub start: i64,
    /// Step width.
    pub step: i64,
    /// Last step (inclusive).
    pub end: i64,
}

impl TimeStepParams {
    fn step_range(&self) -> StepRange {
        StepRange::new(self.start, self.step, self.end)
    }
}

/// Parse `query` into a logical plan evaluated at `params`.
pub fn parse_query(query: &str, params: TimeStepParams) -> Result<LogicalPlan> {
    let tokens = lex(query)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        params,
    };
    let plan = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return BadQuerySnafu {
            reason: format!("unexpected trailing input at token {}", parser.pos),
        }
        .fail();
    }
    Ok(plan)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Duration(i64),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Op(&'static str),
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '[' => {
                // range window: [5m]
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| i + p)
                    .ok_or_else(|| bad("unterminated range selector"))?;
                let body: String = chars[i + 1..close].iter().collect();
                tokens.push(Token::Duration(parse_duration(&body)?));
                i = close + 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return BadQuerySnafu {
                        reason: "unterminated string literal",
                    }
                    .fail();
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '=' => {
                if chars.get(i + 1) == Some(&'~') {
                    tokens.push(Token::Op("=~"));
                    i += 2;
                } else if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("=="));
                    i += 2;
                } else {
                    tokens.push(Token::Op("="));
                    i += 1;
                }
            }
            '!' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::Op("!="));
                    i += 2;
                }
                Some('~') => {
                    tokens.push(Token::Op("!~"));
                    i += 2;
                }
                _ => return Err(bad("stray '!'")),
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(">="));
                    i += 2;
                } else {
                    tokens.push(Token::Op(">"));
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("<="));
                    i += 2;
                } else {
                    tokens.push(Token::Op("<"));
                    i += 1;
                }
            }
            '+' => {
                tokens.push(Token::Op("+"));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op("-"));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op("*"));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op("/"));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Op("%"));
                i += 1;
            }
            '^' => {
                tokens.push(Token::Op("^"));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == 'e'
                        || chars[i] == 'E'
                        || (matches!(chars[i], '+' | '-')
                            && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| bad(&format!("bad number '{text}'")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == ':' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == ':')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(bad(&format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn bad(reason: &str) -> crate::QueryError {
    crate::QueryError::BadQuery {
        reason: reason.to_string(),
    }
}

fn parse_duration(body: &str) -> Result<i64> {
    let split = body
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| bad(&format!("duration '{body}' is missing a unit")))?;
    let (num, unit) = body.split_at(split);
    let n: i64 = num
        .parse()
        .map_err(|_| bad(&format!("bad duration '{body}'")))?;
    let ms = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        _ => return Err(bad(&format!("unknown duration unit '{unit}'"))),
    };
    Ok(n * ms)
}

/// A parsed vector-matching clause on a binary operator.
#[derive(Debug, Default, Clone)]
struct Matching {
    on: Vec<String>,
    ignoring: Vec<String>,
    include: Vec<String>,
    cardinality: Option<Cardinality>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    params: TimeStepParams,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_ident(&self) -> Option<&str> {
        match self.peek() {
            Some(Token::Ident(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn next(&mut self) -> Result<Token> {
        let t = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| bad("unexpected end of query"))?;
        self.pos += 1;
        Ok(t)
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        let t = self.next()?;
        if &t != token {
            return Err(bad(&format!("expected {token:?}, found {t:?}")));
        }
        Ok(())
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if self.peek_ident() == Some(word) {
            self.pos += 1;
            return true;
        }
        false
    }

    // precedence climbing, loosest first: or < and/unless < comparisons
    // < +- < */% < ^
    fn expr(&mut self) -> Result<LogicalPlan> {
        let mut lhs = self.and_expr()?;
        while self.eat_ident("or") {
            let matching = self.matching()?;
            let rhs = self.and_expr()?;
            lhs = self.set_op(lhs, SetOperator::Or, rhs, matching)?;
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<LogicalPlan> {
        let mut lhs = self.cmp_expr()?;
        loop {
            let op = if self.eat_ident("and") {
                SetOperator::And
            } else if self.eat_ident("unless") {
                SetOperator::Unless
            } else {
                break;
            };
            let matching = self.matching()?;
            let rhs = self.cmp_expr()?;
            lhs = self.set_op(lhs, op, rhs, matching)?;
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<LogicalPlan> {
        let mut lhs = self.add_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("==")) => BinaryOperator::Eq,
                Some(Token::Op("!=")) => BinaryOperator::NotEq,
                Some(Token::Op(">")) => BinaryOperator::Gt,
                Some(Token::Op("<")) => BinaryOperator::Lt,
                Some(Token::Op(">=")) => BinaryOperator::Gte,
                Some(Token::Op("<=")) => BinaryOperator::Lte,
                _ => break,
            };
            self.pos += 1;
            // `bool` modifier is accepted and treated as the filter form
            self.eat_ident("bool");
            let matching = self.matching()?;
            let rhs = self.add_expr()?;
            lhs = self.binary(lhs, op, rhs, matching)?;
        }
        Ok(lhs)
    }

    fn add_expr(&mut self) -> Result<LogicalPlan> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinaryOperator::Add,
                Some(Token::Op("-")) => BinaryOperator::Sub,
                _ => break,
            };
            self.pos += 1;
            let matching = self.matching()?;
            let rhs = self.mul_expr()?;
            lhs = self.binary(lhs, op, rhs, matching)?;
        }
        Ok(lhs)
    }

    fn mul_expr(&mut self) -> Result<LogicalPlan> {
        let mut lhs = self.pow_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinaryOperator::Mul,
                Some(Token::Op("/")) => BinaryOperator::Div,
                Some(Token::Op("%")) => BinaryOperator::Mod,
                _ => break,
            };
            self.pos += 1;
            let matching = self.matching()?;
            let rhs = self.pow_expr()?;
            lhs = self.binary(lhs, op, rhs, matching)?;
        }
        Ok(lhs)
    }

    fn pow_expr(&mut self) -> Result<LogicalPlan> {
        let lhs = self.unary_expr()?;
        if self.eat_op("^") {
            let matching = self.matching()?;
            let rhs = self.pow_expr()?;
            return self.binary(lhs, BinaryOperator::Pow, rhs, matching);
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> Result<LogicalPlan> {
        if self.eat_op("-") {
            let inner = self.unary_expr()?;
            let zero = LogicalPlan::ScalarFixedDouble {
                value: 0.0,
                step_range: self.params.step_range(),
            };
            return self.binary(zero, BinaryOperator::Sub, inner, Matching::default());
        }
        self.atom()
    }

    fn matching(&mut self) -> Result<Matching> {
        let mut m = Matching::default();
        if self.eat_ident("on") {
            m.on = self.label_list()?;
        } else if self.eat_ident("ignoring") {
            m.ignoring = self.label_list()?;
        }
        if self.eat_ident("group_left") {
            m.cardinality = Some(Cardinality::ManyToOne);
            if matches!(self.peek(), Some(Token::LParen)) {
                m.include = self.label_list()?;
            }
        } else if self.eat_ident("group_right") {
            m.cardinality = Some(Cardinality::OneToMany);
            if matches!(self.peek(), Some(Token::LParen)) {
                m.include = self.label_list()?;
            }
        }
        Ok(m)
    }

    fn label_list(&mut self) -> Result<Vec<String>> {
        self.expect(&Token::LParen)?;
        let mut labels = Vec::new();
        loop {
            match self.next()? {
                Token::RParen => break,
                Token::Ident(name) => {
                    labels.push(name);
                    match self.next()? {
                        Token::RParen => break,
                        Token::Comma => continue,
                        t => return Err(bad(&format!("expected ',' or ')', found {t:?}"))),
                    }
                }
                Token::Comma => continue,
                t => return Err(bad(&format!("expected label name, found {t:?}"))),
            }
        }
        Ok(labels)
    }

    fn is_scalar(plan: &LogicalPlan) -> bool {
        matches!(
            plan,
            LogicalPlan::ScalarFixedDouble { .. }
                | LogicalPlan::ScalarTimeBased { .. }
                | LogicalPlan::ScalarVaryingDouble { .. }
                | LogicalPlan::ScalarBinaryOperation { .. }
        )
    }

    fn set_op(
        &self,
        lhs: LogicalPlan,
        op: SetOperator,
        rhs: LogicalPlan,
        matching: Matching,
    ) -> Result<LogicalPlan> {
        if Self::is_scalar(&lhs) || Self::is_scalar(&rhs) {
            return BadQuerySnafu {
                reason: "set operators are not defined between scalars",
            }
            .fail();
        }
        Ok(LogicalPlan::SetOperation {
            lhs: Box::new(lhs),
            op,
            rhs: Box::new(rhs),
            on: matching.on,
            ignoring: matching.ignoring,
        })
    }

    fn binary(
        &self,
        lhs: LogicalPlan,
        op: BinaryOperator,
        rhs: LogicalPlan,
        matching: Matching,
    ) -> Result<LogicalPlan> {
        match (Self::is_scalar(&lhs), Self::is_scalar(&rhs)) {
            (true, true) => Ok(LogicalPlan::ScalarBinaryOperation {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            }),
            (true, false) => Ok(LogicalPlan::ScalarVectorBinaryOperation {
                scalar: Box::new(lhs),
                vector: Box::new(rhs),
                op,
                scalar_is_lhs: true,
            }),
            (false, true) => Ok(LogicalPlan::ScalarVectorBinaryOperation {
                scalar: Box::new(rhs),
                vector: Box::new(lhs),
                op,
                scalar_is_lhs: false,
            }),
            (false, false) => Ok(LogicalPlan::BinaryJoin {
                lhs: Box::new(lhs),
                op,
                cardinality: matching.cardinality.unwrap_or(Cardinality::OneToOne),
                rhs: Box::new(rhs),
                on: matching.on,
                ignoring: matching.ignoring,
                include: matching.include,
            }),
        }
    }

    fn atom(&mut self) -> Result<LogicalPlan> {
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(LogicalPlan::ScalarFixedDouble {
                    value: n,
                    step_range: self.params.step_range(),
                })
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBrace) => {
                let (filters, columns) = self.selector(None)?;
                self.periodic(filters, columns)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if matches!(self.peek(), Some(Token::LParen))
                    || (is_aggregation(&name)
                        && matches!(self.peek_ident(), Some("by" | "without")))
                {
                    return self.call(&name);
                }
                let (filters, columns) = self.selector(Some(name))?;
                self.periodic(filters, columns)
            }
            other => Err(bad(&format!("unexpected token {other:?}"))),
        }
    }

    /// Parse `{matchers}` (with an optional metric name and `::column`
    /// suffix already split off the name).
    fn selector(&mut self, name: Option<String>) -> Result<(Vec<ColumnFilter>, Vec<String>)> {
        let mut filters = Vec::new();
        let mut columns = Vec::new();
        if let Some(name) = name {
            let (metric, column) = match name.split_once("::") {
                Some((m, c)) => (m.to_string(), Some(c.to_string())),
                None => (name, None),
            };
            filters.push(ColumnFilter::equals("__name__", metric));
            columns.extend(column);
        }

        if matches!(self.peek(), Some(Token::LBrace)) {
            self.pos += 1;
            loop {
                match self.next()? {
                    Token::RBrace => break,
                    Token::Ident(label) => {
                        let op = match self.next()? {
                            Token::Op("=") => FilterOp::Equals as fn(String) -> FilterOp,
                            Token::Op("!=") => FilterOp::NotEquals,
                            Token::Op("=~") => FilterOp::EqualsRegex,
                            Token::Op("!~") => FilterOp::NotEqualsRegex,
                            t => return Err(bad(&format!("bad matcher operator {t:?}"))),
                        };
                        let value = match self.next()? {
                            Token::Str(s) => s,
                            t => return Err(bad(&format!("matcher value must be a string, found {t:?}"))),
                        };
                        filters.push(ColumnFilter::new(label, op(value)));
                    }
                    Token::Comma => continue,
                    t => return Err(bad(&format!("bad matcher {t:?}"))),
                }
            }
        }
        Ok((filters, columns))
    }

    fn periodic(&self, filters: Vec<ColumnFilter>, columns: Vec<String>) -> Result<LogicalPlan> {
        Ok(LogicalPlan::PeriodicSeries {
            raw: Box::new(self.raw(filters, columns)),
            step_range: self.params.step_range(),
        })
    }

    fn raw(&self, filters: Vec<ColumnFilter>, columns: Vec<String>) -> LogicalPlan {
        LogicalPlan::RawSeries {
            filters,
            columns,
            range: TimeRange::new(self.params.start, self.params.end),
        }
    }

    /// Parse `sel[window]` as the argument of a range function.
    fn range_selector(&mut self) -> Result<(Vec<ColumnFilter>, Vec<String>, i64)> {
        let (filters, columns) = match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                self.selector(Some(name))?
            }
            Some(Token::LBrace) => self.selector(None)?,
            t => return Err(bad(&format!("expected selector, found {t:?}"))),
        };
        let window = match self.next()? {
            Token::Duration(ms) => ms,
            t => return Err(bad(&format!("expected range window, found {t:?}"))),
        };
        Ok((filters, columns, window))
    }

    fn number_arg(&mut self) -> Result<f64> {
        let negative = self.eat_op("-");
        match self.next()? {
            Token::Number(n) => Ok(if negative { -n } else { n }),
            t => Err(bad(&format!("expected number, found {t:?}"))),
        }
    }

    fn call(&mut self, name: &str) -> Result<LogicalPlan> {
        if let Some(range_fn) = range_function(name) {
            self.expect(&Token::LParen)?;
            let extra = if matches!(range_fn, RangeFunction::QuantileOverTime(_)) {
                let q = self.number_arg()?;
                self.expect(&Token::Comma)?;
                Some(q)
            } else {
                None
            };
            let (filters, columns, window) = self.range_selector()?;
            self.expect(&Token::RParen)?;
            let function = match (range_fn, extra) {
                (RangeFunction::QuantileOverTime(_), Some(q)) => {
                    RangeFunction::QuantileOverTime(q)
                }
                (f, _) => f,
            };
            return Ok(LogicalPlan::PeriodicSeriesWithWindowing {
                raw: Box::new(self.raw(filters, columns)),
                step_range: self.params.step_range(),
                window,
                function,
            });
        }

        if is_aggregation(name) {
            return self.aggregation(name);
        }

        match name {
            "time" => {
                self.expect(&Token::LParen)?;
                self.expect(&Token::RParen)?;
                Ok(LogicalPlan::ScalarTimeBased {
                    step_range: self.params.step_range(),
                })
            }
            "vector" => {
                self.expect(&Token::LParen)?;
                let scalar = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(LogicalPlan::VectorPlan {
                    scalar: Box::new(scalar),
                })
            }
            "scalar" => {
                self.expect(&Token::LParen)?;
                let vector = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(LogicalPlan::ScalarVaryingDouble {
                    vector: Box::new(vector),
                })
            }
            "sort" | "sort_desc" => {
                self.expect(&Token::LParen)?;
                let vector = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(LogicalPlan::ApplySortFunction {
                    vector: Box::new(vector),
                    descending: name == "sort_desc",
                })
            }
            "absent" => {
                self.expect(&Token::LParen)?;
                let vector = self.expr()?;
                self.expect(&Token::RParen)?;
                let filters = match vector.find_leaves().first() {
                    Some(LogicalPlan::RawSeries { filters, .. }) => filters.clone(),
                    _ => vec![],
                };
                Ok(LogicalPlan::ApplyAbsentFunction {
                    vector: Box::new(vector),
                    filters,
                    step_range: self.params.step_range(),
                })
            }
            "hist_to_prom_vectors" => {
                self.expect(&Token::LParen)?;
                let vector = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(LogicalPlan::ApplyMiscellaneousFunction {
                    vector: Box::new(vector),
                    function: MiscFunction::HistToPromVectors,
                })
            }
            "histogram_quantile" => {
                self.expect(&Token::LParen)?;
                let q = self.number_arg()?;
                self.expect(&Token::Comma)?;
                let vector = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(LogicalPlan::ApplyInstantFunction {
                    vector: Box::new(vector),
                    function: InstantFunction::HistogramQuantile(q),
                })
            }
            "round" => {
                self.expect(&Token::LParen)?;
                let vector = self.expr()?;
                let to = if matches!(self.peek(), Some(Token::Comma)) {
                    self.pos += 1;
                    self.number_arg()?
                } else {
                    1.0
                };
                self.expect(&Token::RParen)?;
                Ok(LogicalPlan::ApplyInstantFunction {
                    vector: Box::new(vector),
                    function: InstantFunction::Round(to),
                })
            }
            "clamp_min" | "clamp_max" => {
                self.expect(&Token::LParen)?;
                let vector = self.expr()?;
                self.expect(&Token::Comma)?;
                let bound = self.number_arg()?;
                self.expect(&Token::RParen)?;
                let function = if name == "clamp_min" {
                    InstantFunction::ClampMin(bound)
                } else {
                    InstantFunction::ClampMax(bound)
                };
                Ok(LogicalPlan::ApplyInstantFunction {
                    vector: Box::new(vector),
                    function,
                })
            }
            _ => {
                let function = instant_function(name)
                    .ok_or_else(|| bad(&format!("unknown function '{name}'")))?;
                self.expect(&Token::LParen)?;
                let vector = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(LogicalPlan::ApplyInstantFunction {
                    vector: Box::new(vector),
                    function,
                })
            }
        }
    }

    fn aggregation(&mut self, name: &str) -> Result<LogicalPlan> {
        // grouping may precede or follow the body
        let mut grouping = self.grouping()?;

        self.expect(&Token::LParen)?;
        let op = match name {
            "topk" | "bottomk" => {
                let k = self.number_arg()?;
                self.expect(&Token::Comma)?;
                if name == "topk" {
                    AggregationOperator::TopK(k as usize)
                } else {
                    AggregationOperator::BottomK(k as usize)
                }
            }
            "quantile" => {
                let q = self.number_arg()?;
                self.expect(&Token::Comma)?;
                AggregationOperator::Quantile(q)
            }
            "count_values" => {
                let label = match self.next()? {
                    Token::Str(s) => s,
                    t => return Err(bad(&format!("count_values label must be a string, found {t:?}"))),
                };
                self.expect(&Token::Comma)?;
                AggregationOperator::CountValues(label)
            }
            "sum" => AggregationOperator::Sum,
            "avg" => AggregationOperator::Avg,
            "min" => AggregationOperator::Min,
            "max" => AggregationOperator::Max,
            "count" => AggregationOperator::Count,
            "stddev" => AggregationOperator::Stddev,
            "stdvar" => AggregationOperator::Stdvar,
            "group" => AggregationOperator::Group,
            other => return Err(bad(&format!("unknown aggregation '{other}'"))),
        };
        let inner = self.expr()?;
        self.expect(&Token::RParen)?;

        if matches!(grouping, Grouping::None) {
            grouping = self.grouping()?;
        }

        Ok(LogicalPlan::Aggregate {
            op,
            inner: Box::new(inner),
            grouping,
        })
    }

    fn grouping(&mut self) -> Result<Grouping> {
        if self.eat_ident("by") {
            Ok(Grouping::By(self.label_list()?))
        } else if self.eat_ident("without") {
            Ok(Grouping::Without(self.label_list()?))
        } else {
            Ok(Grouping::None)
        }
    }
}

fn is_aggregation(name: &str) -> bool {
    matches!(
        name,
        "sum"
            | "avg"
            | "min"
            | "max"
            | "count"
            | "stddev"
            | "stdvar"
            | "topk"
            | "bottomk"
            | "quantile"
            | "count_values"
            | "group"
    )
}

fn range_function(name: &str) -> Option<RangeFunction> {
    Some(match name {
        "rate" => RangeFunction::Rate,
        "irate" => RangeFunction::Irate,
        "increase" => RangeFunction::Increase,
        "delta" => RangeFunction::Delta,
        "sum_over_time" => RangeFunction::SumOverTime,
        "avg_over_time" => RangeFunction::AvgOverTime,
        "count_over_time" => RangeFunction::CountOverTime,
        "min_over_time" => RangeFunction::MinOverTime,
        "max_over_time" => RangeFunction::MaxOverTime,
        "stddev_over_time" => RangeFunction::StddevOverTime,
        "stdvar_over_time" => RangeFunction::StdvarOverTime,
        "quantile_over_time" => RangeFunction::QuantileOverTime(0.0),
        _ => return None,
    })
}

fn instant_function(name: &str) -> Option<InstantFunction> {
    Some(match name {
        "abs" => InstantFunction::Abs,
        "ceil" => InstantFunction::Ceil,
        "floor" => InstantFunction::Floor,
        "exp" => InstantFunction::Exp,
        "ln" => InstantFunction::Ln,
        "log2" => InstantFunction::Log2,
        "log10" => InstantFunction::Log10,
        "sqrt" => InstantFunction::Sqrt,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn params() -> TimeStepParams {
        TimeStepParams {
            start: 60_000,
            step: 60_000,
            end: 600_000,
        }
    }

    fn parse(q: &str) -> LogicalPlan {
        parse_query(q, params()).unwrap()
    }

    #[test]
    fn test_selector_with_matchers() {
        let plan = parse(r#"heap{app="x",dc!="us"}"#);
        let LogicalPlan::PeriodicSeries { raw, step_range } = plan else {
            panic!("expected periodic series");
        };
        assert_eq!(step_range.start, 60_000);
        let LogicalPlan::RawSeries { filters, .. } = *raw else {
            panic!("expected raw series");
        };
        assert_eq!(filters.len(), 3);
        assert_eq!(filters[0], ColumnFilter::equals("__name__", "heap"));
        assert_eq!(
            filters[2],
            ColumnFilter::new("dc", FilterOp::NotEquals("us".into()))
        );
    }

    #[test]
    fn test_column_selection_suffix() {
        let plan = parse(r#"latency::h{app="x"}"#);
        let leaves = plan.find_leaves();
        let LogicalPlan::RawSeries { columns, filters, .. } = leaves[0] else {
            panic!("expected raw leaf");
        };
        assert_eq!(columns, &["h".to_string()]);
        assert_eq!(filters[0], ColumnFilter::equals("__name__", "latency"));
    }

    #[test]
    fn test_rate_over_window() {
        let plan = parse(r#"rate(requests{app="x"}[5m])"#);
        assert_matches!(
            plan,
            LogicalPlan::PeriodicSeriesWithWindowing {
                window: 300_000,
                function: RangeFunction::Rate,
                ..
            }
        );
    }

    #[test]
    fn test_quantile_over_time() {
        let plan = parse(r#"quantile_over_time(0.95, lat[1m])"#);
        assert_matches!(
            plan,
            LogicalPlan::PeriodicSeriesWithWindowing {
                function: RangeFunction::QuantileOverTime(q),
                window: 60_000,
                ..
            } if (q - 0.95).abs() < 1e-12
        );
    }

    #[test]
    fn test_aggregation_by() {
        let plan = parse(r#"sum by (dc) (heap{app="x"})"#);
        let LogicalPlan::Aggregate { op, grouping, .. } = plan else {
            panic!("expected aggregate");
        };
        assert_matches!(op, AggregationOperator::Sum);
        assert_eq!(grouping, Grouping::By(vec!["dc".into()]));
    }

    #[test]
    fn test_aggregation_without_postfix() {
        let plan = parse(r#"avg(heap) without (inst)"#);
        let LogicalPlan::Aggregate { grouping, .. } = plan else {
            panic!("expected aggregate");
        };
        assert_eq!(grouping, Grouping::Without(vec!["inst".into()]));
    }

    #[test]
    fn test_topk() {
        let plan = parse(r#"topk(3, heap)"#);
        assert_matches!(
            plan,
            LogicalPlan::Aggregate {
                op: AggregationOperator::TopK(3),
                ..
            }
        );
    }

    #[test]
    fn test_count_values() {
        let plan = parse(r#"count_values("version", build_info)"#);
        assert_matches!(
            plan,
            LogicalPlan::Aggregate {
                op: AggregationOperator::CountValues(label),
                ..
            } if label == "version"
        );
    }

    #[test]
    fn test_vector_arithmetic_is_join() {
        let plan = parse(r#"a + b"#);
        assert_matches!(
            plan,
            LogicalPlan::BinaryJoin {
                op: BinaryOperator::Add,
                cardinality: Cardinality::OneToOne,
                ..
            }
        );
    }

    #[test]
    fn test_group_left_matching() {
        let plan = parse(r#"a * on (dc) group_left (role) b"#);
        let LogicalPlan::BinaryJoin {
            cardinality,
            on,
            include,
            ..
        } = plan
        else {
            panic!("expected join");
        };
        assert_eq!(cardinality, Cardinality::ManyToOne);
        assert_eq!(on, vec!["dc".to_string()]);
        assert_eq!(include, vec!["role".to_string()]);
    }

    #[test]
    fn test_set_operators() {
        assert_matches!(
            parse("a and b"),
            LogicalPlan::SetOperation {
                op: SetOperator::And,
                ..
            }
        );
        assert_matches!(
            parse("a unless b"),
            LogicalPlan::SetOperation {
                op: SetOperator::Unless,
                ..
            }
        );
        assert_matches!(
            parse("a or b"),
            LogicalPlan::SetOperation {
                op: SetOperator::Or,
                ..
            }
        );
    }

    #[test]
    fn test_scalar_vector() {
        let plan = parse("heap / 1024");
        assert_matches!(
            plan,
            LogicalPlan::ScalarVectorBinaryOperation {
                op: BinaryOperator::Div,
                scalar_is_lhs: false,
                ..
            }
        );

        let plan = parse("2 * heap");
        assert_matches!(
            plan,
            LogicalPlan::ScalarVectorBinaryOperation {
                scalar_is_lhs: true,
                ..
            }
        );
    }

    #[test]
    fn test_scalar_scalar() {
        assert_matches!(parse("1 + 2 * 3"), LogicalPlan::ScalarBinaryOperation { .. });
        assert_matches!(parse("time()"), LogicalPlan::ScalarTimeBased { .. });
    }

    #[test]
    fn test_precedence_mul_before_add() {
        let LogicalPlan::ScalarBinaryOperation { lhs, op, rhs } = parse("1 + 2 * 3") else {
            panic!("expected scalar op");
        };
        assert_matches!(op, BinaryOperator::Add);
        assert_matches!(*lhs, LogicalPlan::ScalarFixedDouble { value, .. } if value == 1.0);
        assert_matches!(*rhs, LogicalPlan::ScalarBinaryOperation { .. });
    }

    #[test]
    fn test_functions() {
        assert_matches!(
            parse("abs(heap)"),
            LogicalPlan::ApplyInstantFunction {
                function: InstantFunction::Abs,
                ..
            }
        );
        assert_matches!(
            parse("histogram_quantile(0.9, latency)"),
            LogicalPlan::ApplyInstantFunction {
                function: InstantFunction::HistogramQuantile(q),
                ..
            } if (q - 0.9).abs() < 1e-12
        );
        assert_matches!(
            parse("sort_desc(heap)"),
            LogicalPlan::ApplySortFunction {
                descending: true,
                ..
            }
        );
        assert_matches!(
            parse("vector(1)"),
            LogicalPlan::VectorPlan { .. }
        );
        assert_matches!(
            parse("scalar(heap)"),
            LogicalPlan::ScalarVaryingDouble { .. }
        );
        assert_matches!(
            parse("hist_to_prom_vectors(latency)"),
            LogicalPlan::ApplyMiscellaneousFunction {
                function: MiscFunction::HistToPromVectors,
                ..
            }
        );
    }

    #[test]
    fn test_absent_carries_filters() {
        let plan = parse(r#"absent(heap{app="x"})"#);
        let LogicalPlan::ApplyAbsentFunction { filters, .. } = plan else {
            panic!("expected absent");
        };
        assert!(filters.contains(&ColumnFilter::equals("app", "x")));
    }

    #[test]
    fn test_parenthesized_grouping() {
        let plan = parse("(a + b) / c");
        assert_matches!(
            plan,
            LogicalPlan::BinaryJoin {
                op: BinaryOperator::Div,
                ..
            }
        );
    }

    #[test]
    fn test_errors() {
        let e = parse_query("rate(heap)", params()).unwrap_err();
        assert_matches!(e, crate::QueryError::BadQuery { .. });
        assert!(parse_query("nosuchfn(heap)", params()).is_err());
        assert!(parse_query(r#"heap{app="x"#, params()).is_err());
        assert!(parse_query("heap +", params()).is_err());
    }

    #[test]
    fn test_durations() {
        assert_eq!(parse_duration("5m").unwrap(), 300_000);
        assert_eq!(parse_duration("90s").unwrap(), 90_000);
        assert_eq!(parse_duration("2h").unwrap(), 7_200_000);
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("m").is_err());
    }
}
