//! Tree-walking backend. Shares the frontend and value model with the
//! bytecode pipeline and exists as a reference implementation for
//! differential testing.

use std::rc::Rc;

use indexmap::IndexMap;
use tamarin_object::{
    builtin_by_name, Env, Environment, Function, HashPair, Value,
};
use tamarin_syntax::{Block, Expr, FunctionLit, InfixOp, PrefixOp, Program, Stmt};

pub fn eval_program(program: &Program, env: &Env) -> Value {
    let mut result = Value::Null;
    for stmt in &program.statements {
        result = eval_stmt(stmt, env);
        match result {
            // Unwrapped here, at the outermost level only.
            Value::Return(value) => return value.as_ref().clone(),
            Value::Error(_) => return result,
            _ => {}
        }
    }
    result
}

fn eval_stmt(stmt: &Stmt, env: &Env) -> Value {
    match stmt {
        Stmt::Expr { expr, .. } => eval_expr(expr, env),
        Stmt::Let { name, value, .. } => {
            let value = eval_expr(value, env);
            if value.is_error() {
                return value;
            }
            env.borrow_mut().set(name.name.clone(), value);
            Value::Null
        }
        Stmt::Return { value, .. } => {
            let value = eval_expr(value, env);
            if value.is_error() {
                return value;
            }
            Value::Return(Rc::new(value))
        }
    }
}

// Return and Error values pass through blocks untouched so they keep
// bubbling until a function boundary or the program level handles them.
fn eval_block(block: &Block, env: &Env) -> Value {
    let mut result = Value::Null;
    for stmt in &block.statements {
        result = eval_stmt(stmt, env);
        if matches!(result, Value::Return(_) | Value::Error(_)) {
            return result;
        }
    }
    result
}

fn eval_expr(expr: &Expr, env: &Env) -> Value {
    match expr {
        Expr::Int { value, .. } => Value::Integer(*value),
        Expr::Str { value, .. } => Value::Str(Rc::new(value.clone())),
        Expr::Bool { value, .. } => Value::Boolean(*value),
        Expr::Ident(ident) => match env.borrow().get(&ident.name) {
            Some(value) => value,
            None => match builtin_by_name(&ident.name) {
                Some(builtin) => Value::Builtin(builtin),
                None => Value::Error(format!("identifier not found: {}", ident.name)),
            },
        },
        Expr::Prefix { op, right, .. } => {
            let right = eval_expr(right, env);
            if right.is_error() {
                return right;
            }
            eval_prefix(*op, right)
        }
        Expr::Infix {
            op, left, right, ..
        } => {
            let left = eval_expr(left, env);
            if left.is_error() {
                return left;
            }
            let right = eval_expr(right, env);
            if right.is_error() {
                return right;
            }
            eval_infix(*op, left, right)
        }
        Expr::If {
            condition,
            consequence,
            alternative,
            ..
        } => {
            let condition = eval_expr(condition, env);
            if condition.is_error() {
                return condition;
            }
            if condition.is_truthy() {
                eval_block(consequence, env)
            } else {
                match alternative {
                    Some(alternative) => eval_block(alternative, env),
                    None => Value::Null,
                }
            }
        }
        Expr::Function(lit) => eval_function_literal(lit, env),
        Expr::Call {
            function,
            arguments,
            ..
        } => {
            let function = eval_expr(function, env);
            if function.is_error() {
                return function;
            }
            let args = match eval_expressions(arguments, env) {
                Ok(args) => args,
                Err(error) => return error,
            };
            apply_function(function, &args)
        }
        Expr::Array { elements, .. } => match eval_expressions(elements, env) {
            Ok(elements) => Value::Array(Rc::new(elements)),
            Err(error) => error,
        },
        Expr::Hash { pairs, .. } => eval_hash_literal(pairs, env),
        Expr::Index { left, index, .. } => {
            let left = eval_expr(left, env);
            if left.is_error() {
                return left;
            }
            let index = eval_expr(index, env);
            if index.is_error() {
                return index;
            }
            eval_index(left, index)
        }
    }
}

fn eval_function_literal(lit: &FunctionLit, env: &Env) -> Value {
    Value::Function(Rc::new(Function {
        parameters: lit.parameters.clone(),
        body: lit.body.clone(),
        env: Rc::clone(env),
    }))
}

fn eval_expressions(exprs: &[Expr], env: &Env) -> Result<Vec<Value>, Value> {
    let mut values = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let value = eval_expr(expr, env);
        if value.is_error() {
            return Err(value);
        }
        values.push(value);
    }
    Ok(values)
}

fn eval_prefix(op: PrefixOp, right: Value) -> Value {
    match op {
        PrefixOp::Bang => Value::Boolean(!right.is_truthy()),
        PrefixOp::Minus => match right {
            Value::Integer(value) => Value::Integer(value.wrapping_neg()),
            other => Value::Error(format!("unknown operator: -{}", other.kind())),
        },
    }
}

fn eval_infix(op: InfixOp, left: Value, right: Value) -> Value {
    match (&left, &right) {
        (Value::Integer(left), Value::Integer(right)) => {
            eval_integer_infix(op, *left, *right)
        }
        (Value::Str(left), Value::Str(right)) => match op {
            InfixOp::Plus => {
                let mut joined = String::with_capacity(left.len() + right.len());
                joined.push_str(left);
                joined.push_str(right);
                Value::Str(Rc::new(joined))
            }
            InfixOp::Eq => Value::Boolean(left == right),
            InfixOp::NotEq => Value::Boolean(left != right),
            _ => Value::Error(format!("unknown operator: STRING {op} STRING")),
        },
        _ if op == InfixOp::Eq => Value::Boolean(left == right),
        _ if op == InfixOp::NotEq => Value::Boolean(left != right),
        _ if left.kind() != right.kind() => Value::Error(format!(
            "type mismatch: {} {op} {}",
            left.kind(),
            right.kind()
        )),
        _ => Value::Error(format!(
            "unknown operator: {} {op} {}",
            left.kind(),
            right.kind()
        )),
    }
}

fn eval_integer_infix(op: InfixOp, left: i64, right: i64) -> Value {
    match op {
        InfixOp::Plus => Value::Integer(left.wrapping_add(right)),
        InfixOp::Minus => Value::Integer(left.wrapping_sub(right)),
        InfixOp::Asterisk => Value::Integer(left.wrapping_mul(right)),
        InfixOp::Slash => {
            if right == 0 {
                Value::Error("division by zero".to_string())
            } else {
                Value::Integer(left.wrapping_div(right))
            }
        }
        InfixOp::Lt => Value::Boolean(left < right),
        InfixOp::Gt => Value::Boolean(left > right),
        InfixOp::Eq => Value::Boolean(left == right),
        InfixOp::NotEq => Value::Boolean(left != right),
    }
}

fn eval_hash_literal(pairs: &[(Expr, Expr)], env: &Env) -> Value {
    let mut hash = IndexMap::new();
    for (key_expr, value_expr) in pairs {
        let key = eval_expr(key_expr, env);
        if key.is_error() {
            return key;
        }
        let hash_key = match key.hash_key() {
            Some(hash_key) => hash_key,
            None => return Value::Error(format!("unusable as hash key: {}", key.kind())),
        };
        let value = eval_expr(value_expr, env);
        if value.is_error() {
            return value;
        }
        hash.insert(hash_key, HashPair { key, value });
    }
    Value::Hash(Rc::new(hash))
}

fn eval_index(left: Value, index: Value) -> Value {
    match (&left, &index) {
        (Value::Array(elements), Value::Integer(position)) => {
            let max = elements.len() as i64 - 1;
            if *position < 0 || *position > max {
                Value::Null
            } else {
                elements[*position as usize].clone()
            }
        }
        (Value::Hash(pairs), _) => match index.hash_key() {
            Some(key) => match pairs.get(&key) {
                Some(pair) => pair.value.clone(),
                None => Value::Null,
            },
            None => Value::Error(format!("unusable as hash key: {}", index.kind())),
        },
        _ => Value::Error(format!("index operator not supported: {}", left.kind())),
    }
}

fn apply_function(function: Value, args: &[Value]) -> Value {
    match function {
        Value::Function(func) => {
            if args.len() != func.parameters.len() {
                return Value::Error(format!(
                    "wrong number of arguments: want={}, got={}",
                    func.parameters.len(),
                    args.len()
                ));
            }
            let extended = Environment::new_enclosed(Rc::clone(&func.env));
            for (parameter, arg) in func.parameters.iter().zip(args) {
                extended
                    .borrow_mut()
                    .set(parameter.name.clone(), arg.clone());
            }
            match eval_block(&func.body, &extended) {
                Value::Return(value) => value.as_ref().clone(),
                other => other,
            }
        }
        Value::Builtin(builtin) => (builtin.func)(args),
        other => Value::Error(format!("not a function: {}", other.kind())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tamarin_parser::parse;

    fn eval_source(source: &str) -> Value {
        let (program, errors) = parse(source);
        assert!(errors.is_empty(), "parse errors for {source:?}: {errors:?}");
        let env = Environment::new();
        eval_program(&program, &env)
    }

    fn int(value: i64) -> Value {
        Value::Integer(value)
    }

    fn boolean(value: bool) -> Value {
        Value::Boolean(value)
    }

    fn string(text: &str) -> Value {
        Value::Str(Rc::new(text.to_string()))
    }

    fn assert_error(source: &str, expected: &str) {
        match eval_source(source) {
            Value::Error(message) => assert_eq!(message, expected, "{source}"),
            other => panic!("expected error for {source:?}, got {other:?}"),
        }
    }

    #[test]
    fn evaluates_integer_expressions() {
        let cases = [
            ("5", 5),
            ("10", 10),
            ("-5", -5),
            ("-10", -10),
            ("5 + 5 + 5 + 5 - 10", 10),
            ("2 * 2 * 2 * 2 * 2", 32),
            ("-50 + 100 + -50", 0),
            ("5 * 2 + 10", 20),
            ("5 + 2 * 10", 25),
            ("20 + 2 * -10", 0),
            ("50 / 2 * 2 + 10", 60),
            ("2 * (5 + 10)", 30),
            ("3 * 3 * 3 + 10", 37),
            ("3 * (3 * 3) + 10", 37),
            ("(5 + 10 * 2 + 15 / 3) * 2 + -10", 50),
        ];
        for (source, expected) in cases {
            assert_eq!(eval_source(source), int(expected), "{source}");
        }
    }

    #[test]
    fn evaluates_boolean_expressions() {
        let cases = [
            ("true", true),
            ("false", false),
            ("1 < 2", true),
            ("1 > 2", false),
            ("1 == 1", true),
            ("1 != 2", true),
            ("true == true", true),
            ("false != true", true),
            ("(1 < 2) == true", true),
            ("(1 > 2) == false", true),
        ];
        for (source, expected) in cases {
            assert_eq!(eval_source(source), boolean(expected), "{source}");
        }
    }

    #[test]
    fn evaluates_bang_operator() {
        let cases = [
            ("!true", false),
            ("!false", true),
            ("!5", false),
            ("!!true", true),
            ("!!false", false),
            ("!!5", true),
        ];
        for (source, expected) in cases {
            assert_eq!(eval_source(source), boolean(expected), "{source}");
        }
    }

    #[test]
    fn evaluates_if_else_expressions() {
        let cases = [
            ("if (true) { 10 }", int(10)),
            ("if (false) { 10 }", Value::Null),
            ("if (1) { 10 }", int(10)),
            ("if (1 < 2) { 10 }", int(10)),
            ("if (1 > 2) { 10 }", Value::Null),
            ("if (1 > 2) { 10 } else { 20 }", int(20)),
            ("if (1 < 2) { 10 } else { 20 }", int(10)),
        ];
        for (source, expected) in cases {
            assert_eq!(eval_source(source), expected, "{source}");
        }
    }

    #[test]
    fn return_statements_short_circuit() {
        let cases = [
            ("return 10;", 10),
            ("return 10; 9;", 10),
            ("return 2 * 5; 9;", 10),
            ("9; return 2 * 5; 9;", 10),
            (
                "if (10 > 1) { if (10 > 1) { return 10; } return 1; }",
                10,
            ),
        ];
        for (source, expected) in cases {
            assert_eq!(eval_source(source), int(expected), "{source}");
        }
    }

    #[test]
    fn errors_propagate_and_abort_evaluation() {
        let cases = [
            ("5 + true;", "type mismatch: INTEGER + BOOLEAN"),
            ("5 + true; 5;", "type mismatch: INTEGER + BOOLEAN"),
            ("-true", "unknown operator: -BOOLEAN"),
            ("true + false;", "unknown operator: BOOLEAN + BOOLEAN"),
            ("5; true + false; 5", "unknown operator: BOOLEAN + BOOLEAN"),
            (
                "if (10 > 1) { true + false; }",
                "unknown operator: BOOLEAN + BOOLEAN",
            ),
            (
                "if (10 > 1) { if (10 > 1) { return true + false; } return 1; }",
                "unknown operator: BOOLEAN + BOOLEAN",
            ),
            ("foobar", "identifier not found: foobar"),
            ("\"Hello\" - \"World\"", "unknown operator: STRING - STRING"),
            (
                "{\"name\": \"Tam\"}[fn(x) { x }];",
                "unusable as hash key: FUNCTION",
            ),
            ("5 / 0", "division by zero"),
            ("5();", "not a function: INTEGER"),
        ];
        for (source, expected) in cases {
            assert_error(source, expected);
        }
    }

    #[test]
    fn evaluates_let_statements() {
        let cases = [
            ("let a = 5; a;", 5),
            ("let a = 5 * 5; a;", 25),
            ("let a = 5; let b = a; b;", 5),
            ("let a = 5; let b = a; let c = a + b + 5; c;", 15),
        ];
        for (source, expected) in cases {
            assert_eq!(eval_source(source), int(expected), "{source}");
        }
    }

    #[test]
    fn function_literals_capture_their_environment() {
        match eval_source("fn(x) { x + 2; };") {
            Value::Function(func) => {
                assert_eq!(func.parameters.len(), 1);
                assert_eq!(func.parameters[0].name, "x");
                assert_eq!(func.body.to_string(), "(x + 2)");
            }
            other => panic!("expected function, got {other:?}"),
        }
    }

    #[test]
    fn applies_functions_and_closures() {
        let cases = [
            ("let identity = fn(x) { x; }; identity(5);", 5),
            ("let identity = fn(x) { return x; }; identity(5);", 5),
            ("let double = fn(x) { x * 2; }; double(5);", 10),
            ("let add = fn(x, y) { x + y; }; add(5, 5);", 10),
            ("let add = fn(x, y) { x + y; }; add(5 + 5, add(5, 5));", 20),
            ("fn(x) { x; }(5)", 5),
            (
                "let newAdder = fn(x) { fn(y) { x + y }; };
                 let addTwo = newAdder(2);
                 addTwo(2);",
                4,
            ),
        ];
        for (source, expected) in cases {
            assert_eq!(eval_source(source), int(expected), "{source}");
        }
    }

    #[test]
    fn applies_functions_with_wrong_arity_errors() {
        assert_error(
            "let add = fn(x, y) { x + y; }; add(1);",
            "wrong number of arguments: want=2, got=1",
        );
    }

    #[test]
    fn evaluates_string_expressions() {
        assert_eq!(eval_source("\"Hello World!\""), string("Hello World!"));
        assert_eq!(
            eval_source("\"Hello\" + \" \" + \"World!\""),
            string("Hello World!")
        );
        assert_eq!(eval_source("\"a\" == \"a\""), boolean(true));
        assert_eq!(eval_source("\"a\" != \"a\""), boolean(false));
    }

    #[test]
    fn evaluates_array_literals_and_indexing() {
        assert_eq!(
            eval_source("[1, 2 * 2, 3 + 3]").inspect(),
            "[1, 4, 6]"
        );
        let cases = [
            ("[1, 2, 3][0]", int(1)),
            ("[1, 2, 3][1]", int(2)),
            ("[1, 2, 3][2]", int(3)),
            ("let i = 0; [1][i];", int(1)),
            ("[1, 2, 3][1 + 1];", int(3)),
            ("let myArray = [1, 2, 3]; myArray[2];", int(3)),
            (
                "let myArray = [1, 2, 3]; myArray[0] + myArray[1] + myArray[2];",
                int(6),
            ),
            (
                "let myArray = [1, 2, 3]; let i = myArray[0]; myArray[i]",
                int(2),
            ),
            ("[1, 2, 3][3]", Value::Null),
            ("[1, 2, 3][-1]", Value::Null),
        ];
        for (source, expected) in cases {
            assert_eq!(eval_source(source), expected, "{source}");
        }
    }

    #[test]
    fn evaluates_hash_literals_with_mixed_keys() {
        let source = "let two = \"two\";
            {
                \"one\": 10 - 9,
                two: 1 + 1,
                \"thr\" + \"ee\": 6 / 2,
                4: 4,
                true: 5,
                false: 6
            }";
        match eval_source(source) {
            Value::Hash(pairs) => {
                assert_eq!(pairs.len(), 6);
                let expected = [
                    (string("one").hash_key(), 1),
                    (string("two").hash_key(), 2),
                    (string("three").hash_key(), 3),
                    (int(4).hash_key(), 4),
                    (boolean(true).hash_key(), 5),
                    (boolean(false).hash_key(), 6),
                ];
                for (key, value) in expected {
                    let key = key.expect("hashable");
                    assert_eq!(pairs[&key].value, int(value));
                }
            }
            other => panic!("expected hash, got {other:?}"),
        }
    }

    #[test]
    fn evaluates_hash_index_expressions() {
        let cases = [
            ("{\"foo\": 5}[\"foo\"]", int(5)),
            ("{\"foo\": 5}[\"bar\"]", Value::Null),
            ("let key = \"foo\"; {\"foo\": 5}[key]", int(5)),
            ("{}[\"foo\"]", Value::Null),
            ("{5: 5}[5]", int(5)),
            ("{true: 5}[true]", int(5)),
            ("{false: 5}[false]", int(5)),
        ];
        for (source, expected) in cases {
            assert_eq!(eval_source(source), expected, "{source}");
        }
    }

    #[test]
    fn recursion_reaches_bindings_through_the_captured_environment() {
        let source = "let counter = fn(x) { if (x > 3) { return x; } else { counter(x + 1); } };
                      counter(0)";
        assert_eq!(eval_source(source), int(4));
    }

    #[test]
    fn builtins_resolve_by_name() {
        assert_eq!(eval_source("len(\"four\")"), int(4));
        assert_eq!(eval_source("first([1, 2])"), int(1));
        assert_eq!(
            eval_source("len(1)"),
            Value::Error("argument to `len` not supported, got INTEGER".to_string())
        );
    }

    #[test]
    fn matches_the_bytecode_backend_on_shared_programs() {
        use tamarin_vm::{Compiler, Vm};

        let sources = [
            "1 + 2 * 3",
            "let a = 5; let b = a > 3; if (b) { 10 } else { 1 };",
            "let newAdder = fn(a) { fn(b) { a + b } }; let addTwo = newAdder(2); addTwo(3)",
            "let counter = fn(x) { if (x > 3) { return x; } else { counter(x + 1); } }; counter(0)",
            "let h = {\"one\": 1, \"two\": 2}; h[\"one\"] + h[\"two\"]",
            "let map = fn(arr, f) {
                 let iter = fn(a, acc) {
                     if (len(a) == 0) { acc } else { iter(rest(a), push(acc, f(first(a)))) }
                 };
                 iter(arr, [])
             };
             map([1, 2, 3], fn(x) { x * 2 })",
            "[1, 2, 3][3]",
            "[1, 2, 3][-1]",
            "{1: 1}[0]",
            "!(if (false) { 5; })",
            "let fibonacci = fn(x) {
                 if (x == 0) { return 0; }
                 else { if (x == 1) { return 1; }
                 else { fibonacci(x - 1) + fibonacci(x - 2); } }
             };
             fibonacci(10);",
        ];
        for source in sources {
            let (program, errors) = parse(source);
            assert!(errors.is_empty(), "parse errors for {source:?}: {errors:?}");

            let walked = eval_program(&program, &Environment::new());

            let mut compiler = Compiler::new();
            compiler.compile(&program).expect("compile");
            let mut vm = Vm::new(compiler.bytecode());
            vm.run().expect("run");
            let executed = vm.last_popped_stack_elem();

            assert_eq!(
                walked.inspect(),
                executed.inspect(),
                "backends disagree on {source:?}"
            );
        }
    }
}
