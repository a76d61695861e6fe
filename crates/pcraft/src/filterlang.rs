//! A small in-process capture-filter language, standing in for an external
//! BPF compiler (`tcpdump -d`) per the design notes' "an in-process BPF
//! engine is an acceptable substitute" allowance.
//!
//! Supports `proto <name>`, `host <ip>`, `src host <ip>`, `dst host <ip>`,
//! parenthesized groups, and `and`/`or`/`not`. This is intentionally far
//! smaller than real BPF: callers needing full expressiveness should shell
//! out to `tcpdump`/`tshark` instead (see [`crate::replay`] for the same
//! external-tool tradeoff on the send side).

use std::net::IpAddr;

use winnow::ascii::multispace0;
use winnow::combinator::{alt, delimited, preceded};
use winnow::token::take_while;
use winnow::{ModalResult, Parser};

use crate::error::{Error, Result};

/// The fields of a decoded packet that filter expressions can test against.
/// A caller's [`crate::packet::Packet`] implementation maps its own fields
/// onto this shape to use [`CompiledFilter::matches`].
#[derive(Debug, Clone, Default)]
pub struct FilterFields {
    pub protocol: Option<String>,
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq)]
enum FilterExpr {
    Proto(String),
    SrcHost(IpAddr),
    DstHost(IpAddr),
    AnyHost(IpAddr),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    fn eval(&self, fields: &FilterFields) -> bool {
        match self {
            FilterExpr::Proto(name) => fields
                .protocol
                .as_deref()
                .map(|p| p.eq_ignore_ascii_case(name))
                .unwrap_or(false),
            FilterExpr::SrcHost(ip) => fields.src == Some(*ip),
            FilterExpr::DstHost(ip) => fields.dst == Some(*ip),
            FilterExpr::AnyHost(ip) => fields.src == Some(*ip) || fields.dst == Some(*ip),
            FilterExpr::And(a, b) => a.eval(fields) && b.eval(fields),
            FilterExpr::Or(a, b) => a.eval(fields) || b.eval(fields),
            FilterExpr::Not(inner) => !inner.eval(fields),
        }
    }
}

/// A parsed, ready-to-evaluate capture filter.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    expr: FilterExpr,
}

impl CompiledFilter {
    pub fn matches(&self, fields: &FilterFields) -> bool {
        self.expr.eval(fields)
    }
}

/// Parse a filter expression, e.g. `"proto icmp and host 10.0.0.1"`.
pub fn compile(expr: &str) -> Result<CompiledFilter> {
    let mut input = expr;
    let parsed = or_expr(&mut input).map_err(|e| Error::InvalidFilter(format!("{e}")))?;
    let remaining = input.trim();
    if !remaining.is_empty() {
        return Err(Error::InvalidFilter(format!("unexpected trailing input: {remaining:?}")));
    }
    Ok(CompiledFilter { expr: parsed })
}

fn ident<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    delimited(multispace0, take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '.' || c == ':'), multispace0).parse_next(input)
}

fn ip_literal(input: &mut &str) -> ModalResult<IpAddr> {
    use winnow::error::{ErrMode, ContextError};
    let text = ident(input)?;
    text.parse::<IpAddr>()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

fn keyword<'a>(word: &'static str) -> impl Parser<&'a str, &'a str, winnow::error::ContextError> {
    move |input: &mut &'a str| {
        let parsed = ident(input)?;
        if parsed.eq_ignore_ascii_case(word) {
            Ok(parsed)
        } else {
            Err(winnow::error::ErrMode::Backtrack(winnow::error::ContextError::new()))
        }
    }
}

fn proto_expr(input: &mut &str) -> ModalResult<FilterExpr> {
    preceded(keyword("proto"), ident).map(|name: &str| FilterExpr::Proto(name.to_string())).parse_next(input)
}

fn host_expr(input: &mut &str) -> ModalResult<FilterExpr> {
    alt((
        preceded((keyword("src"), keyword("host")), ip_literal).map(FilterExpr::SrcHost),
        preceded((keyword("dst"), keyword("host")), ip_literal).map(FilterExpr::DstHost),
        preceded(keyword("host"), ip_literal).map(FilterExpr::AnyHost),
    ))
    .parse_next(input)
}

fn atom(input: &mut &str) -> ModalResult<FilterExpr> {
    alt((
        delimited((multispace0, '(', multispace0), or_expr, (multispace0, ')', multispace0)),
        preceded(keyword("not"), atom).map(|e| FilterExpr::Not(Box::new(e))),
        proto_expr,
        host_expr,
    ))
    .parse_next(input)
}

fn and_expr(input: &mut &str) -> ModalResult<FilterExpr> {
    let first = atom.parse_next(input)?;
    let mut acc = first;
    loop {
        let checkpoint = *input;
        match preceded(keyword("and"), atom).parse_next(input) {
            Ok(rhs) => acc = FilterExpr::And(Box::new(acc), Box::new(rhs)),
            Err(_) => {
                *input = checkpoint;
                break;
            }
        }
    }
    Ok(acc)
}

fn or_expr(input: &mut &str) -> ModalResult<FilterExpr> {
    let first = and_expr.parse_next(input)?;
    let mut acc = first;
    loop {
        let checkpoint = *input;
        match preceded(keyword("or"), and_expr).parse_next(input) {
            Ok(rhs) => acc = FilterExpr::Or(Box::new(acc), Box::new(rhs)),
            Err(_) => {
                *input = checkpoint;
                break;
            }
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(protocol: &str, src: &str, dst: &str) -> FilterFields {
        FilterFields {
            protocol: Some(protocol.to_string()),
            src: src.parse().ok(),
            dst: dst.parse().ok(),
        }
    }

    #[test]
    fn matches_simple_proto() {
        let filter = compile("proto icmp").unwrap();
        assert!(filter.matches(&fields("icmp", "1.1.1.1", "2.2.2.2")));
        assert!(!filter.matches(&fields("tcp", "1.1.1.1", "2.2.2.2")));
    }

    #[test]
    fn matches_host_either_direction() {
        let filter = compile("host 1.1.1.1").unwrap();
        assert!(filter.matches(&fields("icmp", "1.1.1.1", "9.9.9.9")));
        assert!(filter.matches(&fields("icmp", "9.9.9.9", "1.1.1.1")));
        assert!(!filter.matches(&fields("icmp", "9.9.9.9", "8.8.8.8")));
    }

    #[test]
    fn combines_and_or_not() {
        let filter = compile("proto icmp and src host 1.1.1.1").unwrap();
        assert!(filter.matches(&fields("icmp", "1.1.1.1", "2.2.2.2")));
        assert!(!filter.matches(&fields("icmp", "3.3.3.3", "2.2.2.2")));

        let filter2 = compile("not proto icmp").unwrap();
        assert!(filter2.matches(&fields("tcp", "1.1.1.1", "2.2.2.2")));
        assert!(!filter2.matches(&fields("icmp", "1.1.1.1", "2.2.2.2")));
    }

    #[test]
    fn parenthesized_groups_bind_correctly() {
        let filter = compile("(proto icmp or proto tcp) and dst host 2.2.2.2").unwrap();
        assert!(filter.matches(&fields("tcp", "1.1.1.1", "2.2.2.2")));
        assert!(!filter.matches(&fields("udp", "1.1.1.1", "2.2.2.2")));
    }

    #[test]
    fn rejects_garbage() {
        assert!(compile("proto").is_err());
        assert!(compile("proto icmp extra garbage").is_err());
    }
}
