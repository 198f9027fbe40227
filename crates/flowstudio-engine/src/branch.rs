//! Condition evaluation and successor selection for branching nodes.

use serde::{Deserialize, Serialize};

use flowstudio_core::trace::StepRecord;

/// Comparison operator of a branch condition. Names are matched exactly;
/// anything unrecognized is kept as `Unknown` and never matches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    #[default]
    Eq,
    Neq,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Gt,
    Lt,
    Regex,
    Truthy,
    Unknown(String),
}

impl From<String> for Operator {
    fn from(name: String) -> Self {
        match name.as_str() {
            "eq" => Operator::Eq,
            "neq" => Operator::Neq,
            "contains" => Operator::Contains,
            "ncontains" | "not-contains" => Operator::NotContains,
            "starts" | "starts-with" => Operator::StartsWith,
            "ends" | "ends-with" => Operator::EndsWith,
            "gt" => Operator::Gt,
            "lt" => Operator::Lt,
            "regex" => Operator::Regex,
            "truthy" => Operator::Truthy,
            _ => Operator::Unknown(name),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        match op {
            Operator::Eq => "eq".into(),
            Operator::Neq => "neq".into(),
            Operator::Contains => "contains".into(),
            Operator::NotContains => "not-contains".into(),
            Operator::StartsWith => "starts-with".into(),
            Operator::EndsWith => "ends-with".into(),
            Operator::Gt => "gt".into(),
            Operator::Lt => "lt".into(),
            Operator::Regex => "regex".into(),
            Operator::Truthy => "truthy".into(),
            Operator::Unknown(name) => name,
        }
    }
}

/// One `left <operator> right` test. Operands are templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub left: serde_json::Value,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub right: serde_json::Value,
}

/// Result of a single condition test.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub result: bool,
    pub reason: String,
}

impl Evaluation {
    fn new(result: bool, reason: String) -> Self {
        Self { result, reason }
    }
}

/// Evaluate an operator against already-resolved operands.
pub fn evaluate(operator: &Operator, left: &str, right: &str) -> Evaluation {
    let verb = |yes: &str, no: &str, ok: bool| if ok { yes.to_string() } else { no.to_string() };

    match operator {
        Operator::Truthy => {
            let ok = is_truthy(left);
            let reason = format!("'{left}' is {}", verb("truthy", "not truthy", ok));
            Evaluation::new(ok, reason)
        }
        Operator::Eq => {
            let ok = left == right;
            let reason = format!("'{left}' {} '{right}'", verb("equals", "does not equal", ok));
            Evaluation::new(ok, reason)
        }
        Operator::Neq => {
            let ok = left != right;
            let reason = format!("'{left}' {} '{right}'", verb("does not equal", "equals", ok));
            Evaluation::new(ok, reason)
        }
        Operator::Contains => {
            let ok = left.contains(right);
            let reason = format!("'{left}' {} '{right}'", verb("contains", "does not contain", ok));
            Evaluation::new(ok, reason)
        }
        Operator::NotContains => {
            let ok = !left.contains(right);
            let reason = format!("'{left}' {} '{right}'", verb("does not contain", "contains", ok));
            Evaluation::new(ok, reason)
        }
        Operator::StartsWith => {
            let ok = left.starts_with(right);
            let reason = format!(
                "'{left}' {} '{right}'",
                verb("starts with", "does not start with", ok)
            );
            Evaluation::new(ok, reason)
        }
        Operator::EndsWith => {
            let ok = left.ends_with(right);
            let reason = format!("'{left}' {} '{right}'", verb("ends with", "does not end with", ok));
            Evaluation::new(ok, reason)
        }
        Operator::Gt | Operator::Lt => {
            let greater = *operator == Operator::Gt;
            let word = if greater { "greater than" } else { "less than" };
            match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
                (Ok(l), Ok(r)) => {
                    let ok = if greater { l > r } else { l < r };
                    Evaluation::new(ok, format!("{l} {} {word} {r}", verb("is", "is not", ok)))
                }
                _ => {
                    let ok = if greater { left > right } else { left < right };
                    Evaluation::new(
                        ok,
                        format!(
                            "'{left}' {} {word} '{right}' (string comparison)",
                            verb("is", "is not", ok)
                        ),
                    )
                }
            }
        }
        Operator::Regex => match regex::Regex::new(right) {
            Ok(re) => {
                let ok = re.is_match(left);
                let reason = format!(
                    "'{left}' {} regex pattern '{right}'",
                    verb("matches", "does not match", ok)
                );
                Evaluation::new(ok, reason)
            }
            Err(e) => Evaluation::new(false, format!("Regex error: {e}")),
        },
        Operator::Unknown(name) => Evaluation::new(false, format!("Unknown operator: {name}")),
    }
}

/// Operands are resolved text, so only the empty string is falsy.
pub fn is_truthy(value: &str) -> bool {
    !value.is_empty()
}

/// Which arm of an if/elif/else chain won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTaken {
    If,
    Elif(usize),
    Else,
}

impl std::fmt::Display for BranchTaken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchTaken::If => f.write_str("if"),
            BranchTaken::Elif(i) => write!(f, "elif-{i}"),
            BranchTaken::Else => f.write_str("else"),
        }
    }
}

/// Successor mapping of a branch node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchTargets {
    #[serde(default, rename = "if")]
    pub if_target: Option<String>,
    #[serde(default)]
    pub elif: Vec<String>,
    #[serde(default, rename = "else")]
    pub else_target: Option<String>,
}

impl BranchTargets {
    pub fn target(&self, taken: BranchTaken) -> Option<&str> {
        let id = match taken {
            BranchTaken::If => self.if_target.as_deref(),
            BranchTaken::Elif(i) => self.elif.get(i).map(String::as_str),
            BranchTaken::Else => self.else_target.as_deref(),
        };
        id.filter(|s| !s.is_empty())
    }
}

/// Pick the first satisfied condition. The first condition is the `if`,
/// the rest are `elif-0..`; when nothing matches the `else` arm wins.
pub fn select<I>(evaluations: I) -> (BranchTaken, Evaluation)
where
    I: IntoIterator<Item = Evaluation>,
{
    let mut any = false;
    for (i, eval) in evaluations.into_iter().enumerate() {
        any = true;
        if eval.result {
            let taken = if i == 0 {
                BranchTaken::If
            } else {
                BranchTaken::Elif(i - 1)
            };
            return (taken, eval);
        }
    }
    let reason = if any {
        "All conditions evaluated to false"
    } else {
        "No conditions defined"
    };
    (BranchTaken::Else, Evaluation::new(false, reason.to_string()))
}

/// The single successor a completed branching step keeps, if any.
pub fn chosen_successor(step: &StepRecord) -> Option<&str> {
    step.chosen_next().filter(|id| !id.is_empty())
}
