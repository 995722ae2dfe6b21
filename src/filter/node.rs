//! 过滤表达式语法树与求值
//!
//! 语法树一经解析即不可变，针对每个事件重复求值。

use std::cmp::Ordering;
use std::fmt;

use crate::service::properties::{PropertyDictionary, Value, OBJECT_CLASS};

/// 过滤表达式语法树节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterNode {
    /// `(&E1 E2 ...)`
    And(Vec<FilterNode>),
    /// `(|E1 E2 ...)`
    Or(Vec<FilterNode>),
    /// `(!E)`
    Not(Box<FilterNode>),
    /// `(attr=value)`
    Equals { attr: String, value: String },
    /// `(attr~=value)`：忽略大小写与空白
    Approx { attr: String, value: String },
    /// `(attr>=value)`
    GreaterEq { attr: String, value: String },
    /// `(attr<=value)`
    LessEq { attr: String, value: String },
    /// `(attr=a*b*c)`：通配子串匹配
    Substring {
        attr: String,
        pattern: SubstringPattern,
    },
    /// `(attr=*)`：存在性测试
    Present { attr: String },
}

/// 通配子串模式
///
/// `initial*any[0]*any[1]*...*final`，任何一段都可以为空。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubstringPattern {
    pub initial: Option<String>,
    pub any: Vec<String>,
    pub final_part: Option<String>,
}

impl SubstringPattern {
    /// 模式是否不含任何片段（只由 `*` 组成）
    pub fn is_empty(&self) -> bool {
        self.initial.is_none() && self.any.is_empty() && self.final_part.is_none()
    }

    /// 检查字符串是否匹配模式
    pub fn matches(&self, input: &str) -> bool {
        let mut rest = input;

        if let Some(initial) = &self.initial {
            match rest.strip_prefix(initial.as_str()) {
                Some(tail) => rest = tail,
                None => return false,
            }
        }

        for part in &self.any {
            match rest.find(part.as_str()) {
                Some(index) => rest = &rest[index + part.len()..],
                None => return false,
            }
        }

        match &self.final_part {
            Some(final_part) => rest.ends_with(final_part.as_str()),
            None => true,
        }
    }
}

/// 比较运算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Approx,
    Greater,
    Less,
}

impl FilterNode {
    /// 针对属性字典求值
    pub fn matches(&self, properties: &PropertyDictionary) -> bool {
        match self {
            FilterNode::And(children) => children.iter().all(|c| c.matches(properties)),
            FilterNode::Or(children) => children.iter().any(|c| c.matches(properties)),
            FilterNode::Not(child) => !child.matches(properties),
            FilterNode::Equals { attr, value } => compare(properties.get(attr), Op::Equal, value),
            FilterNode::Approx { attr, value } => compare(properties.get(attr), Op::Approx, value),
            FilterNode::GreaterEq { attr, value } => {
                compare(properties.get(attr), Op::Greater, value)
            }
            FilterNode::LessEq { attr, value } => compare(properties.get(attr), Op::Less, value),
            FilterNode::Substring { attr, pattern } => match properties.get(attr) {
                Some(Value::String(s)) => pattern.matches(s),
                Some(Value::StringList(list)) => list.iter().any(|s| pattern.matches(s)),
                _ => false,
            },
            FilterNode::Present { attr } => properties.contains_key(attr),
        }
    }

    /// 收集表达式引用的全部属性名（按出现顺序，可能重复）
    pub fn collect_attributes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FilterNode::And(children) | FilterNode::Or(children) => {
                for child in children {
                    child.collect_attributes(out);
                }
            }
            FilterNode::Not(child) => child.collect_attributes(out),
            FilterNode::Equals { attr, .. }
            | FilterNode::Approx { attr, .. }
            | FilterNode::GreaterEq { attr, .. }
            | FilterNode::LessEq { attr, .. }
            | FilterNode::Substring { attr, .. }
            | FilterNode::Present { attr } => out.push(attr),
        }
    }

    /// 表达式必然要求的 `objectClass` 值
    ///
    /// 只识别两种形式：顶层 `(objectClass=X)`，或顶层 `&` 中某个直接子句为
    /// `(objectClass=X)`。`|`、`!`、通配符都返回 `None`，保证短路判断只会
    /// 放行、不会误拒。
    pub fn required_object_class(&self) -> Option<&str> {
        match self {
            FilterNode::Equals { attr, value } if attr.eq_ignore_ascii_case(OBJECT_CLASS) => {
                Some(value)
            }
            FilterNode::And(children) => children.iter().find_map(|child| match child {
                FilterNode::Equals { .. } => child.required_object_class(),
                _ => None,
            }),
            _ => None,
        }
    }
}

fn compare(property: Option<&Value>, op: Op, operand: &str) -> bool {
    match property {
        None => false,
        Some(Value::String(s)) => compare_string(s, op, operand),
        Some(Value::StringList(list)) => list.iter().any(|s| compare_string(s, op, operand)),
        Some(Value::Number(n)) => compare_number(*n, op, operand),
        Some(Value::Bool(b)) => compare_bool(*b, op, operand),
    }
}

fn compare_string(s: &str, op: Op, operand: &str) -> bool {
    match op {
        Op::Equal => s == operand,
        Op::Approx => approx_eq(s, operand),
        Op::Greater => ordering(s, operand) != Ordering::Less,
        Op::Less => ordering(s, operand) != Ordering::Greater,
    }
}

fn compare_number(n: f64, op: Op, operand: &str) -> bool {
    match operand.trim().parse::<f64>() {
        Ok(rhs) => match n.partial_cmp(&rhs) {
            Some(ord) => match op {
                Op::Equal | Op::Approx => ord == Ordering::Equal,
                Op::Greater => ord != Ordering::Less,
                Op::Less => ord != Ordering::Greater,
            },
            None => false,
        },
        Err(_) => compare_string(&n.to_string(), op, operand),
    }
}

fn compare_bool(b: bool, op: Op, operand: &str) -> bool {
    let rhs = operand.trim();
    let rhs = if rhs.eq_ignore_ascii_case("true") {
        true
    } else if rhs.eq_ignore_ascii_case("false") {
        false
    } else {
        return false;
    };
    // 布尔值没有顺序，四种运算都按相等处理
    let _ = op;
    b == rhs
}

/// 两侧都能解析为数值时按数值比较，否则按字典序
fn ordering(lhs: &str, rhs: &str) -> Ordering {
    match (lhs.trim().parse::<f64>(), rhs.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or_else(|| lhs.cmp(rhs)),
        _ => lhs.cmp(rhs),
    }
}

fn approx_eq(lhs: &str, rhs: &str) -> bool {
    let strip = |s: &str| -> String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect()
    };
    strip(lhs) == strip(rhs)
}

/// 转义 `( ) * \`
fn encode_value(value: &str, out: &mut String) {
    for c in value.chars() {
        if matches!(c, '(' | ')' | '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

impl fmt::Display for FilterNode {
    /// 输出规范化形式
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::from("(");
        match self {
            FilterNode::And(children) | FilterNode::Or(children) => {
                out.push(if matches!(self, FilterNode::And(_)) { '&' } else { '|' });
                for child in children {
                    out.push_str(&child.to_string());
                }
            }
            FilterNode::Not(child) => {
                out.push('!');
                out.push_str(&child.to_string());
            }
            FilterNode::Equals { attr, value } => {
                out.push_str(attr);
                out.push('=');
                encode_value(value, &mut out);
            }
            FilterNode::Approx { attr, value } => {
                out.push_str(attr);
                out.push_str("~=");
                encode_value(value, &mut out);
            }
            FilterNode::GreaterEq { attr, value } => {
                out.push_str(attr);
                out.push_str(">=");
                encode_value(value, &mut out);
            }
            FilterNode::LessEq { attr, value } => {
                out.push_str(attr);
                out.push_str("<=");
                encode_value(value, &mut out);
            }
            FilterNode::Substring { attr, pattern } => {
                out.push_str(attr);
                out.push('=');
                if let Some(initial) = &pattern.initial {
                    encode_value(initial, &mut out);
                }
                out.push('*');
                // 全空模式写作 `**`，单个 `*` 是存在性测试
                if pattern.is_empty() {
                    out.push('*');
                }
                for part in &pattern.any {
                    encode_value(part, &mut out);
                    out.push('*');
                }
                if let Some(final_part) = &pattern.final_part {
                    encode_value(final_part, &mut out);
                }
            }
            FilterNode::Present { attr } => {
                out.push_str(attr);
                out.push_str("=*");
            }
        }
        out.push(')');
        f.write_str(&out)
    }
}
