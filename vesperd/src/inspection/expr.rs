//! Condition expression AST and evaluation result types.
//!
//! Expressions arrive pre-parsed from the scheme ingestion side; the engine
//! only ever walks and evaluates this in-memory form. Nodes are serde
//! types so schemes can also be loaded from local JSON files.

use serde::{Deserialize, Serialize};

use vesper_common::{FetchRequestId, SignalId};

use crate::inspection::history::WindowFunction;

/// Evaluation recursion limit; exceeding it yields
/// [`ExpressionError::StackOverflow`].
pub const MAX_EVAL_DEPTH: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ExpressionNode {
    Boolean {
        value: bool,
    },
    Number {
        value: f64,
    },
    Text {
        value: String,
    },
    /// Latest value of a signal from the condition's history buffers.
    Signal {
        signal_id: SignalId,
    },
    /// One aggregate of a completed fixed-time window over a signal.
    Window {
        function: WindowFunction,
        signal_id: SignalId,
    },
    /// True when the newest sample of the signal was not yet consumed by
    /// the evaluating condition.
    IsNew {
        signal_id: SignalId,
    },
    Not {
        operand: Box<ExpressionNode>,
    },
    Binary {
        operator: BinaryOperator,
        left: Box<ExpressionNode>,
        right: Box<ExpressionNode>,
    },
    If {
        condition: Box<ExpressionNode>,
        then_branch: Box<ExpressionNode>,
        else_branch: Box<ExpressionNode>,
    },
    /// Invocation of a registered custom function.
    Custom {
        function_name: String,
        #[serde(default)]
        args: Vec<ExpressionNode>,
    },
    /// True when a DTC snapshot with at least one active code is installed.
    ActiveDtcQuery,
    /// Emits the fetch request (rate-limited) and yields true.
    FetchRequest {
        fetch_request_id: FetchRequestId,
    },
}

impl ExpressionNode {
    /// Pre-order visit of this node and every child, including custom
    /// function arguments.
    pub fn visit(&self, f: &mut impl FnMut(&ExpressionNode)) {
        f(self);
        match self {
            ExpressionNode::Not { operand } => operand.visit(f),
            ExpressionNode::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            ExpressionNode::If {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.visit(f);
                then_branch.visit(f);
                else_branch.visit(f);
            }
            ExpressionNode::Custom { args, .. } => {
                for arg in args {
                    arg.visit(f);
                }
            }
            _ => {}
        }
    }

    /// Ids of all signals this expression evaluates on, directly or through
    /// a window or freshness check.
    pub fn referenced_signals(&self) -> Vec<SignalId> {
        let mut ids = Vec::new();
        self.visit(&mut |node| match node {
            ExpressionNode::Signal { signal_id }
            | ExpressionNode::Window { signal_id, .. }
            | ExpressionNode::IsNew { signal_id } => {
                if !ids.contains(signal_id) {
                    ids.push(*signal_id);
                }
            }
            _ => {}
        });
        ids
    }

    /// Ids of all fetch requests this expression can emit.
    pub fn referenced_fetch_requests(&self) -> Vec<FetchRequestId> {
        let mut ids = Vec::new();
        self.visit(&mut |node| {
            if let ExpressionNode::FetchRequest { fetch_request_id } = node {
                if !ids.contains(fetch_request_id) {
                    ids.push(*fetch_request_id);
                }
            }
        });
        ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOperator {
    And,
    Or,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
}

/// Result value of evaluating an expression node.
///
/// `Undefined` is not an error: it propagates through operators and makes
/// the condition non-triggering, e.g. while a window has not completed or a
/// script has no result yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectionValue {
    Undefined,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl InspectionValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, InspectionValue::Undefined)
    }

    /// Numeric view with bools promoted to 0/1; `None` for text and
    /// undefined values.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            InspectionValue::Number(n) => Some(*n),
            InspectionValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// Evaluation error kinds. These are data, not failures: an erroring
/// condition simply does not trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionError {
    TypeMismatch,
    Overflow,
    StackOverflow,
    SignalNotFound,
    NotImplemented,
}

impl ExpressionError {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpressionError::TypeMismatch => "type mismatch",
            ExpressionError::Overflow => "overflow",
            ExpressionError::StackOverflow => "stack overflow",
            ExpressionError::SignalNotFound => "signal not found",
            ExpressionError::NotImplemented => "not implemented",
        }
    }
}
