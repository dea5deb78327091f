use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TokenKind {
    Illegal,
    Eof,
    Ident,
    Int,
    String,
    Assign,
    Plus,
    Minus,
    Bang,
    Asterisk,
    Slash,
    Lt,
    Gt,
    Eq,
    NotEq,
    Comma,
    Semicolon,
    Colon,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Function,
    Let,
    True,
    False,
    If,
    Else,
    Return,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TokenKind::Illegal => "ILLEGAL",
            TokenKind::Eof => "EOF",
            TokenKind::Ident => "IDENT",
            TokenKind::Int => "INT",
            TokenKind::String => "STRING",
            TokenKind::Assign => "=",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Bang => "!",
            TokenKind::Asterisk => "*",
            TokenKind::Slash => "/",
            TokenKind::Lt => "<",
            TokenKind::Gt => ">",
            TokenKind::Eq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Comma => ",",
            TokenKind::Semicolon => ";",
            TokenKind::Colon => ":",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Function => "fn",
            TokenKind::Let => "let",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::Return => "return",
        };
        f.write_str(text)
    }
}

/// Keyword table consulted after an identifier has been read.
pub fn lookup_ident(ident: &str) -> TokenKind {
    match ident {
        "fn" => TokenKind::Function,
        "let" => TokenKind::Let,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "return" => TokenKind::Return,
        _ => TokenKind::Ident,
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub literal: String,
}

impl Token {
    pub fn new(kind: TokenKind, literal: impl Into<String>) -> Self {
        Self {
            kind,
            literal: literal.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.statements {
            write!(f, "{stmt}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    Let {
        token: Token,
        name: Ident,
        value: Expr,
    },
    Return {
        token: Token,
        value: Expr,
    },
    Expr {
        token: Token,
        expr: Expr,
    },
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Let { name, value, .. } => write!(f, "let {name} = {value};"),
            Stmt::Return { value, .. } => write!(f, "return {value};"),
            Stmt::Expr { expr, .. } => write!(f, "{expr}"),
        }
    }
}

/// A braced statement sequence, the body form shared by `if` arms and
/// function literals.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub token: Token,
    pub statements: Vec<Stmt>,
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.statements {
            write!(f, "{stmt}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Ident {
    pub token: Token,
    pub name: String,
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PrefixOp {
    Bang,
    Minus,
}

impl fmt::Display for PrefixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefixOp::Bang => f.write_str("!"),
            PrefixOp::Minus => f.write_str("-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InfixOp {
    Plus,
    Minus,
    Asterisk,
    Slash,
    Lt,
    Gt,
    Eq,
    NotEq,
}

impl fmt::Display for InfixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InfixOp::Plus => "+",
            InfixOp::Minus => "-",
            InfixOp::Asterisk => "*",
            InfixOp::Slash => "/",
            InfixOp::Lt => "<",
            InfixOp::Gt => ">",
            InfixOp::Eq => "==",
            InfixOp::NotEq => "!=",
        };
        f.write_str(text)
    }
}

/// Function literals keep the name of the `let` binding they were assigned
/// to, if any. The compiler uses it to resolve self-references without a
/// capture.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionLit {
    pub token: Token,
    pub parameters: Vec<Ident>,
    pub body: Block,
    pub name: Option<String>,
}

impl fmt::Display for FunctionLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fn")?;
        if let Some(name) = &self.name {
            write!(f, "<{name}>")?;
        }
        f.write_str("(")?;
        for (i, param) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") {}", self.body)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Ident(Ident),
    Int {
        token: Token,
        value: i64,
    },
    Str {
        token: Token,
        value: String,
    },
    Bool {
        token: Token,
        value: bool,
    },
    Prefix {
        token: Token,
        op: PrefixOp,
        right: Box<Expr>,
    },
    Infix {
        token: Token,
        op: InfixOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    If {
        token: Token,
        condition: Box<Expr>,
        consequence: Block,
        alternative: Option<Block>,
    },
    Function(FunctionLit),
    Call {
        token: Token,
        function: Box<Expr>,
        arguments: Vec<Expr>,
    },
    Index {
        token: Token,
        left: Box<Expr>,
        index: Box<Expr>,
    },
    Array {
        token: Token,
        elements: Vec<Expr>,
    },
    Hash {
        token: Token,
        pairs: Vec<(Expr, Expr)>,
    },
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Ident(ident) => write!(f, "{ident}"),
            Expr::Int { value, .. } => write!(f, "{value}"),
            Expr::Str { value, .. } => f.write_str(value),
            Expr::Bool { value, .. } => write!(f, "{value}"),
            Expr::Prefix { op, right, .. } => write!(f, "({op}{right})"),
            Expr::Infix {
                op, left, right, ..
            } => write!(f, "({left} {op} {right})"),
            Expr::If {
                condition,
                consequence,
                alternative,
                ..
            } => {
                write!(f, "if{condition} {consequence}")?;
                if let Some(alternative) = alternative {
                    write!(f, "else {alternative}")?;
                }
                Ok(())
            }
            Expr::Function(lit) => write!(f, "{lit}"),
            Expr::Call {
                function,
                arguments,
                ..
            } => {
                write!(f, "{function}(")?;
                for (i, arg) in arguments.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Expr::Index { left, index, .. } => write!(f, "({left}[{index}])"),
            Expr::Array { elements, .. } => {
                f.write_str("[")?;
                for (i, elem) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                f.write_str("]")
            }
            Expr::Hash { pairs, .. } => {
                f.write_str("{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}:{value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Ident {
        Ident {
            token: Token::new(TokenKind::Ident, name),
            name: name.to_string(),
        }
    }

    #[test]
    fn renders_let_statement() {
        let program = Program {
            statements: vec![Stmt::Let {
                token: Token::new(TokenKind::Let, "let"),
                name: ident("myVar"),
                value: Expr::Ident(ident("anotherVar")),
            }],
        };
        assert_eq!(program.to_string(), "let myVar = anotherVar;");
    }

    #[test]
    fn renders_nested_expressions() {
        let expr = Expr::Infix {
            token: Token::new(TokenKind::Plus, "+"),
            op: InfixOp::Plus,
            left: Box::new(Expr::Int {
                token: Token::new(TokenKind::Int, "1"),
                value: 1,
            }),
            right: Box::new(Expr::Prefix {
                token: Token::new(TokenKind::Minus, "-"),
                op: PrefixOp::Minus,
                right: Box::new(Expr::Int {
                    token: Token::new(TokenKind::Int, "2"),
                    value: 2,
                }),
            }),
        };
        assert_eq!(expr.to_string(), "(1 + (-2))");
    }

    #[test]
    fn renders_function_literal_with_bound_name() {
        let lit = FunctionLit {
            token: Token::new(TokenKind::Function, "fn"),
            parameters: vec![ident("x"), ident("y")],
            body: Block {
                token: Token::new(TokenKind::LBrace, "{"),
                statements: Vec::new(),
            },
            name: Some("add".to_string()),
        };
        assert_eq!(lit.to_string(), "fn<add>(x, y) ");
    }

    #[test]
    fn keywords_resolve_through_lookup() {
        assert_eq!(lookup_ident("fn"), TokenKind::Function);
        assert_eq!(lookup_ident("let"), TokenKind::Let);
        assert_eq!(lookup_ident("return"), TokenKind::Return);
        assert_eq!(lookup_ident("letter"), TokenKind::Ident);
    }
}
