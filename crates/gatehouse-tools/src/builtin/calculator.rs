use futures::future::BoxFuture;
use serde::Deserialize;

use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::traits::Tool;
use gatehouse_core::types::{ToolContext, ToolResult};

/// Arithmetic over `+ - * / % ^` and parentheses.
pub struct CalculatorTool;

#[derive(Deserialize)]
struct CalculatorInput {
    expression: String,
}

impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression with + - * / % ^ and parentheses."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": { "type": "string", "description": "Expression to evaluate, e.g. '(2 + 3) * 4'" }
            },
            "required": ["expression"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: CalculatorInput = serde_json::from_value(input)
                .map_err(|e| GatehouseError::ToolValidation(e.to_string()))?;
            let value = evaluate(&p.expression).map_err(|message| GatehouseError::ToolExecution {
                tool: "calculator".into(),
                message,
            })?;
            Ok(ToolResult::success(format_number(value)))
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }
}

/// Integers print without a fractional part.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

const MAX_EXPRESSION_LEN: usize = 4096;
const MAX_NESTING: usize = 64;

pub fn evaluate(expression: &str) -> std::result::Result<f64, String> {
    if expression.len() > MAX_EXPRESSION_LEN {
        return Err(format!("expression longer than {} bytes", MAX_EXPRESSION_LEN));
    }
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected token at position {}", parser.pos));
    }
    if !value.is_finite() {
        return Err("result is not a finite number".into());
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Op(char),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Num(n));
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
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
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    if tokens.is_empty() {
        return Err("empty expression".into());
    }
    Ok(tokens)
}

/// Recursive descent: expr := term (('+'|'-') term)*, term := factor (('*'|'/'|'%') factor)*,
/// factor := unary ('^' factor)?, unary := '-' unary | atom.
///
/// Recursion into `unary` and into the right side of `^` is bounded by `MAX_NESTING`.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.peek();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            value = match op {
                '*' => value * rhs,
                _ if rhs == 0.0 => return Err("division by zero".into()),
                '/' => value / rhs,
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    fn factor(&mut self) -> std::result::Result<f64, String> {
        let base = self.unary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            // right-associative
            let exp = self.nested(Self::factor)?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn nested(
        &mut self,
        parse: fn(&mut Self) -> std::result::Result<f64, String>,
    ) -> std::result::Result<f64, String> {
        if self.depth >= MAX_NESTING {
            return Err("expression too deeply nested".into());
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn unary(&mut self) -> std::result::Result<f64, String> {
        self.nested(Self::unary_inner)
    }

    fn unary_inner(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> std::result::Result<f64, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("missing closing parenthesis".into()),
                }
            }
            Some(t) => Err(format!("unexpected token {:?}", t)),
            None => Err("unexpected end of expression".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::types::InstanceId;

    #[test]
    fn precedence_and_parentheses() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), 4.0);
        assert_eq!(evaluate("10 % 4").unwrap(), 2.0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(evaluate("").is_err());
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("(1").is_err());
        assert!(evaluate("2 x 3").is_err());
        assert_eq!(evaluate("1 / 0").unwrap_err(), "division by zero");
    }

    #[test]
    fn deep_nesting_is_an_error_not_a_crash() {
        let nested = format!("{}1{}", "(".repeat(2_000), ")".repeat(2_000));
        assert_eq!(evaluate(&nested).unwrap_err(), "expression too deeply nested");
        assert_eq!(evaluate(&"-".repeat(1_000)).unwrap_err(), "expression too deeply nested");
        let tower = vec!["2"; 500].join("^");
        assert_eq!(evaluate(&tower).unwrap_err(), "expression too deeply nested");

        let fine = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(evaluate(&fine).unwrap(), 1.0);
    }

    #[test]
    fn oversized_input_is_rejected_before_parsing() {
        let huge = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert!(evaluate(&huge).unwrap_err().contains("longer than"));
    }

    #[test]
    fn formats_integers_without_fraction() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[tokio::test]
    async fn tool_returns_result_text() {
        let ctx = ToolContext {
            instance_id: InstanceId::new(),
            node_id: "responder".into(),
        };
        let result = CalculatorTool
            .execute(serde_json::json!({"expression": "6 * 7"}), ctx)
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, "42");
    }

    #[tokio::test]
    async fn missing_expression_is_validation_error() {
        let ctx = ToolContext {
            instance_id: InstanceId::new(),
            node_id: "responder".into(),
        };
        let err = CalculatorTool
            .execute(serde_json::json!({}), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GatehouseError::ToolValidation(_)));
    }
}
