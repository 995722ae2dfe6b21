//! LDAP 风格过滤表达式
//!
//! 过滤器在监听器注册或查询时解析一次，之后针对每个事件的属性字典重复求值。
//! 语法错误在解析时即被拒绝，错误中保留原始字符串以便排查。

mod node;
mod parser;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub use node::{FilterNode, SubstringPattern};

use crate::service::properties::PropertyDictionary;
use crate::service::ServiceReference;

/// 过滤表达式语法错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("过滤表达式语法错误 (偏移 {offset}): {message}，表达式: \"{filter}\"")]
pub struct InvalidSyntaxError {
    filter: String,
    offset: usize,
    message: String,
}

impl InvalidSyntaxError {
    pub(crate) fn new(filter: &str, offset: usize, message: impl Into<String>) -> Self {
        Self {
            filter: filter.to_string(),
            offset,
            message: message.into(),
        }
    }

    /// 原始过滤字符串
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// 出错位置（字节偏移）
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// 错误描述
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 已解析的过滤器
///
/// 不可变，可廉价克隆后在线程间共享。相等性按规范化形式比较。
#[derive(Debug, Clone)]
pub struct Filter {
    source: String,
    normalized: String,
    root: FilterNode,
}

impl Filter {
    /// 解析过滤表达式
    pub fn parse(source: &str) -> Result<Self, InvalidSyntaxError> {
        let root = parser::Parser::new(source).parse()?;
        Ok(Self {
            source: source.to_string(),
            normalized: root.to_string(),
            root,
        })
    }

    /// 构造 `(objectClass=<name>)`
    pub fn object_class(name: &str) -> Self {
        let root = FilterNode::Equals {
            attr: crate::service::properties::OBJECT_CLASS.to_string(),
            value: name.to_string(),
        };
        let normalized = root.to_string();
        Self {
            source: normalized.clone(),
            normalized,
            root,
        }
    }

    /// 原始表达式文本
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// 语法树根节点
    pub fn root(&self) -> &FilterNode {
        &self.root
    }

    /// 针对属性字典求值
    pub fn matches(&self, properties: &PropertyDictionary) -> bool {
        self.root.matches(properties)
    }

    /// 针对服务引用的当前属性求值，引用失效时不匹配
    pub fn matches_reference(&self, reference: &ServiceReference) -> bool {
        reference
            .properties()
            .map(|props| self.matches(&props))
            .unwrap_or(false)
    }

    /// 表达式引用的属性名（去重，保持首次出现顺序）
    pub fn attributes(&self) -> Vec<&str> {
        let mut all = Vec::new();
        self.root.collect_attributes(&mut all);

        let mut seen = std::collections::HashSet::new();
        all.retain(|attr| seen.insert(attr.to_lowercase()));
        all
    }

    /// 表达式必然要求的单个 `objectClass` 值
    pub fn required_object_class(&self) -> Option<&str> {
        self.root.required_object_class()
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Filter {}

impl std::hash::Hash for Filter {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl FromStr for Filter {
    type Err = InvalidSyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::parse(s)
    }
}
