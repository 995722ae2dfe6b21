//! 过滤表达式解析器
//!
//! 递归下降解析 `(attr=value)`、`(&...)`、`(|...)`、`(!...)` 形式的表达式。
//! 任何语法错误都会带上出错位置（字节偏移）和原始字符串。

use super::node::{FilterNode, SubstringPattern};
use super::InvalidSyntaxError;

/// 最大嵌套深度
const MAX_DEPTH: usize = 256;

type ParseResult<T> = std::result::Result<T, InvalidSyntaxError>;

/// 过滤表达式解析器
pub(crate) struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
        }
    }

    /// 解析完整表达式，不允许尾随字符
    pub(crate) fn parse(mut self) -> ParseResult<FilterNode> {
        let node = self.parse_filter()?;
        if self.pos != self.input.len() {
            return Err(self.error(format!(
                "多余的尾随字符 \"{}\"",
                &self.input[self.pos..]
            )));
        }
        Ok(node)
    }

    fn parse_filter(&mut self) -> ParseResult<FilterNode> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("嵌套层级过深"));
        }

        self.skip_whitespace();
        self.expect('(')?;
        let node = self.parse_filter_comp()?;
        self.skip_whitespace();
        self.expect(')')?;
        self.skip_whitespace();

        self.depth -= 1;
        Ok(node)
    }

    fn parse_filter_comp(&mut self) -> ParseResult<FilterNode> {
        self.skip_whitespace();
        match self.peek_required()? {
            '&' => {
                self.bump();
                Ok(FilterNode::And(self.parse_operands()?))
            }
            '|' => {
                self.bump();
                Ok(FilterNode::Or(self.parse_operands()?))
            }
            '!' => {
                self.bump();
                self.skip_whitespace();
                if self.peek_required()? != '(' {
                    return Err(self.missing('('));
                }
                Ok(FilterNode::Not(Box::new(self.parse_filter()?)))
            }
            _ => self.parse_item(),
        }
    }

    /// `&` / `|` 的操作数列表，至少一个
    fn parse_operands(&mut self) -> ParseResult<Vec<FilterNode>> {
        self.skip_whitespace();
        if self.peek_required()? != '(' {
            return Err(self.missing('('));
        }

        let mut operands = Vec::new();
        while self.peek_required()? == '(' {
            operands.push(self.parse_filter()?);
        }
        Ok(operands)
    }

    fn parse_item(&mut self) -> ParseResult<FilterNode> {
        let attr = self.parse_attr()?;
        self.skip_whitespace();

        let op_start = self.pos;
        let c = self.peek_required()?;
        let two_char = |p: &mut Self, first: char| -> ParseResult<bool> {
            if p.peek_required()? == first {
                p.bump();
                if p.peek_required()? == '=' {
                    p.bump();
                    return Ok(true);
                }
            }
            Ok(false)
        };

        match c {
            '~' => {
                if two_char(self, '~')? {
                    let value = self.parse_value()?;
                    return Ok(FilterNode::Approx { attr, value });
                }
            }
            '>' => {
                if two_char(self, '>')? {
                    let value = self.parse_value()?;
                    return Ok(FilterNode::GreaterEq { attr, value });
                }
            }
            '<' => {
                if two_char(self, '<')? {
                    let value = self.parse_value()?;
                    return Ok(FilterNode::LessEq { attr, value });
                }
            }
            '=' => {
                self.bump();
                if self.peek_required()? == '*' {
                    let rewind = self.pos;
                    self.bump();
                    self.skip_whitespace();
                    if self.peek_required()? == ')' {
                        return Ok(FilterNode::Present { attr });
                    }
                    self.pos = rewind;
                }
                return self.parse_substring(attr);
            }
            _ => {}
        }

        self.pos = op_start;
        Err(self.error(format!("无效的运算符 \"{}\"", &self.input[self.pos..])))
    }

    fn parse_attr(&mut self) -> ParseResult<String> {
        self.skip_whitespace();
        let begin = self.pos;
        let mut end = self.pos;

        loop {
            let c = self.peek_required()?;
            if matches!(c, '~' | '<' | '>' | '=' | '(' | ')') {
                break;
            }
            self.bump();
            if !c.is_whitespace() {
                end = self.pos;
            }
        }

        if end == begin {
            return Err(self.error("缺少属性名"));
        }
        Ok(self.input[begin..end].to_string())
    }

    /// 普通值：`~=`、`>=`、`<=` 之后，`*` 无特殊含义
    fn parse_value(&mut self) -> ParseResult<String> {
        let mut value = String::new();
        loop {
            match self.peek_required()? {
                ')' => break,
                '(' => return Err(self.error("值中出现未转义的 \"(\"")),
                '\\' => {
                    self.bump();
                    value.push(self.bump_required()?);
                }
                c => {
                    self.bump();
                    value.push(c);
                }
            }
        }

        if value.is_empty() {
            return Err(self.error("缺少值"));
        }
        Ok(value)
    }

    /// `=` 之后的值：不含未转义 `*` 时为相等比较，否则为子串模式
    fn parse_substring(&mut self, attr: String) -> ParseResult<FilterNode> {
        // None 表示一个 `*`
        let mut segments: Vec<Option<String>> = Vec::new();
        let mut current = String::new();

        loop {
            match self.peek_required()? {
                ')' => {
                    if !current.is_empty() {
                        segments.push(Some(std::mem::take(&mut current)));
                    }
                    break;
                }
                '(' => return Err(self.error("值中出现未转义的 \"(\"")),
                '*' => {
                    if !current.is_empty() {
                        segments.push(Some(std::mem::take(&mut current)));
                    }
                    segments.push(None);
                    self.bump();
                }
                '\\' => {
                    self.bump();
                    current.push(self.bump_required()?);
                }
                c => {
                    self.bump();
                    current.push(c);
                }
            }
        }

        match segments.as_slice() {
            [] => Err(self.error("缺少值")),
            [Some(value)] => Ok(FilterNode::Equals {
                attr,
                value: value.clone(),
            }),
            _ => Ok(FilterNode::Substring {
                attr,
                pattern: build_pattern(segments),
            }),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.bump();
        }
    }

    fn expect(&mut self, expected: char) -> ParseResult<()> {
        if self.peek_required()? != expected {
            return Err(self.missing(expected));
        }
        self.bump();
        Ok(())
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_required(&self) -> ParseResult<char> {
        self.peek().ok_or_else(|| self.error("表达式意外结束"))
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn bump_required(&mut self) -> ParseResult<char> {
        let c = self.peek_required()?;
        self.pos += c.len_utf8();
        Ok(c)
    }

    fn missing(&self, expected: char) -> InvalidSyntaxError {
        self.error(format!(
            "缺少 \"{}\"，位于 \"{}\"",
            expected,
            &self.input[self.pos..]
        ))
    }

    fn error(&self, message: impl Into<String>) -> InvalidSyntaxError {
        InvalidSyntaxError::new(self.input, self.pos, message)
    }
}

/// 把 `[Some(a), None, Some(b), None]` 形式的片段折叠为模式
fn build_pattern(segments: Vec<Option<String>>) -> SubstringPattern {
    let mut pattern = SubstringPattern::default();
    let last = segments.len().saturating_sub(1);

    for (index, segment) in segments.into_iter().enumerate() {
        let Some(text) = segment else { continue };
        if index == 0 {
            pattern.initial = Some(text);
        } else if index == last {
            pattern.final_part = Some(text);
        } else {
            pattern.any.push(text);
        }
    }
    pattern
}
