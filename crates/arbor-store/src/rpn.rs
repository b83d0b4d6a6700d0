// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Postfix evaluator for compiled filter programs.
//!
//! Register 0 holds the candidate id. The field value of a comparison is
//! pushed last, so it is the first operand popped.
use arbor_query::filter::{Instruction, OpCode};
use arbor_query::{FilterProgram, NodeId};
use serde_json::Value;
use thiserror::Error;

use crate::graph::Database;

/// Malformed program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum RpnError {
    /// An operator found too few operands.
    #[error("stack underflow at {0}")]
    Underflow(char),
    /// A register was referenced but not supplied.
    #[error("missing register ${0}")]
    MissingRegister(usize),
    /// An operand had the wrong kind for its operator.
    #[error("operator {0} expects a name operand")]
    ExpectedName(char),
    /// The program did not reduce to exactly one value.
    #[error("program left {0} values on the stack")]
    Unbalanced(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Num(f64),
    Str(String),
    // String values of a text or object field; equality matches any.
    Strs(Vec<String>),
    Bool(bool),
    Missing,
}

impl Operand {
    fn truthy(&self) -> bool {
        match self {
            Self::Num(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Strs(v) => !v.is_empty(),
            Self::Bool(b) => *b,
            Self::Missing => false,
        }
    }

    fn number(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::Str(s) => s.trim().parse().ok(),
            Self::Strs(_) | Self::Missing => None,
        }
    }

    fn matches(&self, other: &str) -> bool {
        match self {
            Self::Str(s) => s == other,
            Self::Strs(v) => v.iter().any(|s| s == other),
            Self::Num(n) => other.parse::<f64>().is_ok_and(|o| o == *n),
            Self::Bool(_) | Self::Missing => false,
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Evaluates `program` against the candidate `id`.
pub(crate) fn evaluate(program: &FilterProgram, db: &Database, id: &NodeId) -> Result<bool, RpnError> {
    let mut stack: Vec<Operand> = Vec::new();
    for ins in program.instructions() {
        match ins {
            Instruction::Num(n) => stack.push(Operand::Num(n.as_f64().unwrap_or(0.0))),
            Instruction::Name(s) => stack.push(Operand::Str(s.clone())),
            Instruction::Reg(0) => stack.push(Operand::Str(id.to_string())),
            Instruction::Reg(i) => {
                let value = program.register(*i).ok_or(RpnError::MissingRegister(*i))?;
                stack.push(Operand::Str(value.to_owned()));
            }
            Instruction::Op(op) => apply(*op, &mut stack, db, id)?,
        }
    }
    match stack.as_slice() {
        [only] => Ok(only.truthy()),
        other => Err(RpnError::Unbalanced(other.len())),
    }
}

fn apply(op: OpCode, stack: &mut Vec<Operand>, db: &Database, id: &NodeId) -> Result<(), RpnError> {
    let token = op.token();
    let mut pop = || stack.pop().ok_or(RpnError::Underflow(token));
    let result = match op {
        OpCode::Not => Operand::Bool(!pop()?.truthy()),
        OpCode::And | OpCode::Or => {
            let a = pop()?.truthy();
            let b = pop()?.truthy();
            Operand::Bool(if op == OpCode::And { a && b } else { a || b })
        }
        OpCode::Eq | OpCode::Ne | OpCode::Lt | OpCode::Gt | OpCode::Le | OpCode::Ge => {
            let lhs = pop()?;
            let rhs = pop()?;
            let out = match (lhs.number(), rhs.number()) {
                (Some(l), Some(r)) => match op {
                    OpCode::Eq => (l - r).abs() < f64::EPSILON,
                    OpCode::Ne => (l - r).abs() >= f64::EPSILON,
                    OpCode::Lt => l < r,
                    OpCode::Gt => l > r,
                    OpCode::Le => l <= r,
                    _ => l >= r,
                },
                // Comparisons against a missing value never match.
                _ => false,
            };
            Operand::Bool(out)
        }
        OpCode::StrEq | OpCode::IdEq => {
            let lhs = pop()?;
            let rhs = pop()?;
            let out = match rhs.text() {
                Some(r) => lhs.matches(r),
                None => lhs.text().is_some_and(|l| rhs.matches(l)),
            };
            Operand::Bool(out)
        }
        OpCode::TypeEq => {
            let prefix = pop()?;
            let prefix = prefix.text().ok_or(RpnError::ExpectedName(token))?;
            Operand::Bool(id.type_prefix() == prefix)
        }
        OpCode::GetStr | OpCode::GetNum => {
            let name = pop()?;
            let name = name.text().ok_or(RpnError::ExpectedName(token))?;
            let value = db.field(id, name);
            if op == OpCode::GetStr {
                string_operand(value)
            } else {
                number_operand(value)
            }
        }
    };
    stack.push(result);
    Ok(())
}

fn string_operand(value: Option<Value>) -> Operand {
    match value {
        None | Some(Value::Null) => Operand::Missing,
        Some(Value::String(s)) => Operand::Str(s),
        Some(Value::Number(n)) => Operand::Str(n.to_string()),
        Some(Value::Bool(b)) => Operand::Str(b.to_string()),
        Some(Value::Array(items)) => Operand::Strs(
            items.into_iter().filter_map(|v| v.as_str().map(str::to_owned)).collect(),
        ),
        Some(Value::Object(map)) => Operand::Strs(
            map.into_iter().filter_map(|(_, v)| v.as_str().map(str::to_owned)).collect(),
        ),
    }
}

fn number_operand(value: Option<Value>) -> Operand {
    match value {
        Some(Value::Number(n)) => n.as_f64().map_or(Operand::Missing, Operand::Num),
        Some(Value::Bool(b)) => Operand::Bool(b),
        Some(Value::String(s)) => s.trim().parse().map_or(Operand::Missing, Operand::Num),
        _ => Operand::Missing,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::graph::Node;
    use arbor_query::schema::Schema;
    use arbor_query::{compile_filter, Fork};
    use serde_json::json;

    fn schema() -> Schema {
        serde_json::from_value(json!({
            "types": {
                "match": {
                    "prefix": "ma",
                    "fields": {
                        "name": { "type": "string" },
                        "value": { "type": "number" },
                        "title": { "type": "text" }
                    }
                },
                "team": { "prefix": "te", "fields": { "name": { "type": "string" } } }
            }
        }))
        .unwrap()
    }

    fn db() -> Database {
        let mut db = Database::default();
        let mut ma1 = Node::default();
        ma1.fields.insert("type".into(), json!("match"));
        ma1.fields.insert("name".into(), json!("final"));
        ma1.fields.insert("value".into(), json!(5));
        ma1.fields.insert("title".into(), json!({ "en": "ball", "de": "Ball" }));
        db.nodes.insert(NodeId::new("ma1"), ma1);
        db.nodes.insert(NodeId::new("te1"), Node::default());
        db
    }

    fn check(filter: serde_json::Value, id: &str) -> bool {
        let program = compile_filter(&Fork::from_json(&filter).unwrap(), &schema()).unwrap();
        evaluate(&program, &db(), &NodeId::new(id)).unwrap()
    }

    #[test]
    fn numeric_comparisons_use_the_field_as_left_operand() {
        assert!(check(json!({ "$field": "value", "$operator": ">", "$value": 4 }), "ma1"));
        assert!(!check(json!({ "$field": "value", "$operator": "<", "$value": 4 }), "ma1"));
        assert!(check(json!({ "$field": "value", "$operator": "<=", "$value": 5 }), "ma1"));
        assert!(!check(json!({ "$field": "value", "$operator": ">", "$value": 4 }), "te1"));
    }

    #[test]
    fn type_and_id_tests() {
        let both = json!([
            { "$field": "type", "$operator": "=", "$value": "match" },
            { "$field": "id", "$operator": "!=", "$value": "ma2" }
        ]);
        assert!(check(both.clone(), "ma1"));
        assert!(!check(both, "te1"));
    }

    #[test]
    fn string_equality_and_lists() {
        assert!(check(json!({ "$field": "name", "$operator": "=", "$value": "final" }), "ma1"));
        assert!(check(
            json!({ "$field": "name", "$operator": "=", "$value": ["semi", "final"] }),
            "ma1"
        ));
        assert!(!check(
            json!({ "$field": "name", "$operator": "!=", "$value": ["semi", "final"] }),
            "ma1"
        ));
        assert!(check(json!({ "$field": "title", "$operator": "=", "$value": "Ball" }), "ma1"));
    }

    #[test]
    fn existence() {
        assert!(check(json!({ "$field": "name", "$operator": "exists" }), "ma1"));
        assert!(check(json!({ "$field": "name", "$operator": "notExists" }), "te1"));
    }

    #[test]
    fn malformed_programs_are_rejected() {
        let program: FilterProgram = serde_json::from_value(json!({
            "instructions": [{ "Op": "And" }],
            "registers": []
        }))
        .unwrap();
        assert_eq!(
            evaluate(&program, &db(), &NodeId::new("ma1")),
            Err(RpnError::Underflow('M'))
        );
    }
}
