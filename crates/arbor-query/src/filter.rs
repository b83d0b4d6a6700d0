// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filter compiler: boolean [`Fork`] trees to postfix [`FilterProgram`]s.
//!
//! The program is what the storage engine's filter evaluator runs against
//! every node a traversal visits. Register 0 always holds the candidate node
//! id; string comparison values are passed in registers `1..` in first-use
//! order, so identical trees always produce identical programs.
//!
//! Every comparison pushes its right-hand value first and the field value
//! last, making the field the left operand of the operator.
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::CompileError;
use crate::schema::Schema;

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `exists`
    Exists,
    /// `notExists`
    NotExists,
}

impl Operator {
    /// Parses the wire spelling of an operator.
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "=" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            ">" => Self::Gt,
            "<=" => Self::Le,
            ">=" => Self::Ge,
            "exists" => Self::Exists,
            "notExists" => Self::NotExists,
            _ => return None,
        })
    }

    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Exists => "exists",
            Self::NotExists => "notExists",
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterValue {
    /// No value (`exists` / `notExists`).
    None,
    /// String value.
    Str(String),
    /// Numeric value.
    Num(Number),
    /// Boolean value, compared as `1` / `0`.
    Bool(bool),
    /// Any of several values.
    List(Vec<FilterValue>),
}

impl FilterValue {
    fn from_json(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => Self::None,
            Value::String(s) => Self::Str(s.clone()),
            Value::Number(n) => Self::Num(n.clone()),
            Value::Bool(b) => Self::Bool(*b),
            Value::Array(items) => Self::List(
                items
                    .iter()
                    .map(Self::from_json)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Value::Object(_) => return None,
        })
    }
}

/// One comparison leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Comparison {
    /// Field compared (`id` and `type` included).
    pub field: String,
    /// Operator.
    pub operator: Operator,
    /// Right-hand value.
    pub value: FilterValue,
}

/// Boolean filter expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fork {
    /// Comparison leaf.
    Leaf(Comparison),
    /// All children must hold; evaluated in order.
    And(Vec<Fork>),
    /// Any child must hold; evaluated in order.
    Or(Vec<Fork>),
}

impl Fork {
    /// Leaf shorthand.
    pub fn leaf(field: impl Into<String>, operator: Operator, value: FilterValue) -> Self {
        Self::Leaf(Comparison {
            field: field.into(),
            operator,
            value,
        })
    }

    /// `type = <name>` for each name, OR'ed.
    pub fn any_type<S: AsRef<str>>(types: &[S]) -> Self {
        Self::Or(
            types
                .iter()
                .map(|t| Self::leaf("type", Operator::Eq, FilterValue::Str(t.as_ref().to_owned())))
                .collect(),
        )
    }

    /// `<field> exists`.
    pub fn exists(field: impl Into<String>) -> Self {
        Self::leaf(field, Operator::Exists, FilterValue::None)
    }

    /// Parses a `$filter` value: an object or an array of objects (AND'ed).
    ///
    /// An object may carry `$and` / `$or` next to its own comparison:
    /// `{leaf, $and: x, $or: y}` reads as `(leaf AND x) OR y`.
    pub fn from_json(value: &Value) -> Result<Self, CompileError> {
        match value {
            Value::Array(items) => {
                let mut forks = items
                    .iter()
                    .map(Self::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                if forks.len() == 1 {
                    Ok(forks.remove(0))
                } else {
                    Ok(Self::And(forks))
                }
            }
            Value::Object(map) => {
                let field = map.get("$field").and_then(Value::as_str).ok_or_else(|| {
                    CompileError::InvalidFilter(format!("missing $field in {value}"))
                })?;
                let raw_op = map.get("$operator").and_then(Value::as_str).ok_or_else(|| {
                    CompileError::InvalidFilter(format!("missing $operator for {field}"))
                })?;
                let operator =
                    Operator::parse(raw_op).ok_or_else(|| CompileError::UnsupportedOperator {
                        operator: raw_op.to_owned(),
                        field: field.to_owned(),
                    })?;
                let value = match map.get("$value") {
                    Some(v) => FilterValue::from_json(v).ok_or_else(|| {
                        CompileError::InvalidFilter(format!("unsupported $value for {field}"))
                    })?,
                    None => FilterValue::None,
                };
                let mut fork = Self::leaf(field, operator, value);
                if let Some(and) = map.get("$and") {
                    fork = Self::And(vec![fork, Self::from_json(and)?]);
                }
                if let Some(or) = map.get("$or") {
                    fork = Self::Or(vec![fork, Self::from_json(or)?]);
                }
                Ok(fork)
            }
            other => Err(CompileError::InvalidFilter(format!(
                "$filter must be an object or an array, got {other}"
            ))),
        }
    }
}

/// Operator token of a filter program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    /// `F`: numeric equality.
    Eq,
    /// `G`: numeric inequality.
    Ne,
    /// `H`: numeric less-than.
    Lt,
    /// `I`: numeric greater-than.
    Gt,
    /// `J`: numeric less-or-equal.
    Le,
    /// `K`: numeric greater-or-equal.
    Ge,
    /// `L`: logical not.
    Not,
    /// `M`: logical and.
    And,
    /// `N`: logical or.
    Or,
    /// `c`: string equality.
    StrEq,
    /// `d`: node id equality.
    IdEq,
    /// `e`: type prefix of the candidate equals the operand.
    TypeEq,
    /// `f`: read a string field of the candidate.
    GetStr,
    /// `g`: read a numeric field of the candidate.
    GetNum,
}

impl OpCode {
    /// Single-character wire token.
    pub fn token(self) -> char {
        match self {
            Self::Eq => 'F',
            Self::Ne => 'G',
            Self::Lt => 'H',
            Self::Gt => 'I',
            Self::Le => 'J',
            Self::Ge => 'K',
            Self::Not => 'L',
            Self::And => 'M',
            Self::Or => 'N',
            Self::StrEq => 'c',
            Self::IdEq => 'd',
            Self::TypeEq => 'e',
            Self::GetStr => 'f',
            Self::GetNum => 'g',
        }
    }
}

/// One postfix instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instruction {
    /// Operator.
    Op(OpCode),
    /// `#<number>` literal.
    Num(Number),
    /// `"<name>` literal (field names and type prefixes).
    Name(String),
    /// `$<n>` string register.
    Reg(usize),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Op(op) => write!(f, "{}", op.token()),
            Self::Num(n) => write!(f, "#{n}"),
            Self::Name(s) => write!(f, "\"{s}"),
            Self::Reg(i) => write!(f, "${i}"),
        }
    }
}

/// Compiled filter: postfix instructions plus string registers `1..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterProgram {
    instructions: Vec<Instruction>,
    registers: Vec<String>,
}

impl FilterProgram {
    /// Instructions in evaluation order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Register `index` (1-based; register 0 is the candidate id and is not stored).
    pub fn register(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.registers.get(i))
            .map(String::as_str)
    }

    /// Command arguments: the expression followed by the register values.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.registers.len() + 1);
        args.push(self.to_string());
        args.extend(self.registers.iter().cloned());
        args
    }
}

impl fmt::Display for FilterProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ins) in self.instructions.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{ins}")?;
        }
        Ok(())
    }
}

/// Compiles a fork tree against `schema`.
///
/// Compilation is pure: the same tree always yields the same program.
pub fn compile(fork: &Fork, schema: &Schema) -> Result<FilterProgram, CompileError> {
    let mut compiler = Compiler {
        schema,
        out: Vec::new(),
        registers: Vec::new(),
    };
    compiler.fork(fork)?;
    Ok(FilterProgram {
        instructions: compiler.out,
        registers: compiler.registers,
    })
}

struct Compiler<'a> {
    schema: &'a Schema,
    out: Vec<Instruction>,
    registers: Vec<String>,
}

enum Step<'f> {
    Visit(&'f Fork),
    Emit(Instruction),
}

impl Compiler<'_> {
    fn fork(&mut self, root: &Fork) -> Result<(), CompileError> {
        let mut stack = vec![Step::Visit(root)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Emit(ins) => self.out.push(ins),
                Step::Visit(Fork::Leaf(cmp)) => self.leaf(cmp)?,
                Step::Visit(Fork::And(children)) => schedule(&mut stack, children, OpCode::And, 1),
                Step::Visit(Fork::Or(children)) => schedule(&mut stack, children, OpCode::Or, 0),
            }
        }
        Ok(())
    }

    fn op(&mut self, op: OpCode) {
        self.out.push(Instruction::Op(op));
    }

    fn register(&mut self, value: &str) -> usize {
        if let Some(i) = self.registers.iter().position(|r| r == value) {
            return i + 1;
        }
        self.registers.push(value.to_owned());
        self.registers.len()
    }

    fn leaf(&mut self, cmp: &Comparison) -> Result<(), CompileError> {
        if let FilterValue::List(values) = &cmp.value {
            // `=` over a list matches any value, `!=` must differ from all.
            let join = match cmp.operator {
                Operator::Eq => OpCode::Or,
                Operator::Ne => OpCode::And,
                _ => return Err(unsupported(cmp)),
            };
            if values.is_empty() {
                return Err(CompileError::InvalidFilter(format!(
                    "empty $value list for {}",
                    cmp.field
                )));
            }
            for (i, value) in values.iter().enumerate() {
                self.leaf(&Comparison {
                    field: cmp.field.clone(),
                    operator: cmp.operator,
                    value: value.clone(),
                })?;
                if i > 0 {
                    self.op(join);
                }
            }
            return Ok(());
        }

        match cmp.field.as_str() {
            "id" => self.id_leaf(cmp),
            "type" => self.type_leaf(cmp),
            field => {
                if self.schema.any_field(field).is_none() {
                    return Err(CompileError::UnknownFilterField(field.to_owned()));
                }
                self.field_leaf(cmp)
            }
        }
    }

    fn id_leaf(&mut self, cmp: &Comparison) -> Result<(), CompileError> {
        let FilterValue::Str(id) = &cmp.value else {
            return Err(unsupported(cmp));
        };
        let negate = match cmp.operator {
            Operator::Eq => false,
            Operator::Ne => true,
            _ => return Err(unsupported(cmp)),
        };
        let reg = self.register(id);
        self.out.push(Instruction::Reg(reg));
        self.out.push(Instruction::Reg(0));
        self.op(OpCode::IdEq);
        if negate {
            self.op(OpCode::Not);
        }
        Ok(())
    }

    fn type_leaf(&mut self, cmp: &Comparison) -> Result<(), CompileError> {
        let FilterValue::Str(type_name) = &cmp.value else {
            return Err(unsupported(cmp));
        };
        let negate = match cmp.operator {
            Operator::Eq => false,
            Operator::Ne => true,
            _ => return Err(unsupported(cmp)),
        };
        let prefix = self
            .schema
            .prefix_of(type_name)
            .ok_or_else(|| CompileError::UnknownType(type_name.clone()))?;
        self.out.push(Instruction::Name(prefix.to_owned()));
        self.op(OpCode::TypeEq);
        if negate {
            self.op(OpCode::Not);
        }
        Ok(())
    }

    fn field_leaf(&mut self, cmp: &Comparison) -> Result<(), CompileError> {
        let field = Instruction::Name(cmp.field.clone());
        match (cmp.operator, &cmp.value) {
            (Operator::Exists, _) => {
                self.out.push(field);
                self.op(OpCode::GetStr);
            }
            (Operator::NotExists, _) => {
                self.out.push(field);
                self.op(OpCode::GetStr);
                self.op(OpCode::Not);
            }
            (Operator::Eq | Operator::Ne, FilterValue::Str(s)) => {
                let reg = self.register(s);
                self.out.push(Instruction::Reg(reg));
                self.out.push(field);
                self.op(OpCode::GetStr);
                self.op(OpCode::StrEq);
                if cmp.operator == Operator::Ne {
                    self.op(OpCode::Not);
                }
            }
            (op, FilterValue::Num(_) | FilterValue::Bool(_)) => {
                let code = match op {
                    Operator::Eq => OpCode::Eq,
                    Operator::Ne => OpCode::Ne,
                    Operator::Lt => OpCode::Lt,
                    Operator::Gt => OpCode::Gt,
                    Operator::Le => OpCode::Le,
                    Operator::Ge => OpCode::Ge,
                    Operator::Exists | Operator::NotExists => return Err(unsupported(cmp)),
                };
                let number = match &cmp.value {
                    FilterValue::Num(n) => n.clone(),
                    FilterValue::Bool(b) => Number::from(u8::from(*b)),
                    _ => return Err(unsupported(cmp)),
                };
                self.out.push(Instruction::Num(number));
                self.out.push(field);
                self.op(OpCode::GetNum);
                self.op(code);
            }
            _ => return Err(unsupported(cmp)),
        }
        Ok(())
    }
}

// Left fold `c0 c1 op c2 op ...`, pushed reversed because the stack is LIFO.
// An empty combinator evaluates to its identity (`#1` for AND, `#0` for OR).
fn schedule<'f>(stack: &mut Vec<Step<'f>>, children: &'f [Fork], op: OpCode, identity: u8) {
    let Some((first, rest)) = children.split_first() else {
        stack.push(Step::Emit(Instruction::Num(Number::from(identity))));
        return;
    };
    let mut ordered = Vec::with_capacity(children.len() * 2);
    ordered.push(Step::Visit(first));
    for child in rest {
        ordered.push(Step::Visit(child));
        ordered.push(Step::Emit(Instruction::Op(op)));
    }
    stack.extend(ordered.into_iter().rev());
}

fn unsupported(cmp: &Comparison) -> CompileError {
    CompileError::UnsupportedOperator {
        operator: cmp.operator.as_str().to_owned(),
        field: cmp.field.clone(),
    }
}
