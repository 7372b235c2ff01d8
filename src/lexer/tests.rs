use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LexerTestErr {
    UnterminatedString,
    UnknownCharacter(char),
}

fn check_tokens(lexer: &mut Lexer<'_>, expected: &[Token<'_>]) {
    let mut count = 0;

    for (t, expected) in lexer.by_ref().zip(expected) {
        assert_eq!(&t.unwrap().item, expected);
        count += 1;
    }

    assert_eq!(count, expected.len());
    assert!(lexer.next().is_none());
}

fn check_tokens_with_errors(lexer: &mut Lexer<'_>, expected: &[Result<Token<'_>, LexerTestErr>]) {
    let mut count = 0;

    for t in lexer.by_ref().zip(expected) {
        match t {
            (Ok(t), Ok(expected)) => assert_eq!(&t.item, expected),
            (Err(e), Err(expected)) => match (e, expected) {
                (LexerError::UnknownToken(c), LexerTestErr::UnknownCharacter(expected)) => {
                    assert_eq!(c.token(), *expected)
                }
                (LexerError::UnterminatedString(_), LexerTestErr::UnterminatedString) => {}
                (a, b) => panic!("Expected {:?} but got {:?}", b, a),
            },
            (a, b) => panic!("Expected {:?} but got {:?}", b, a),
        }
        count += 1;
    }

    assert_eq!(count, expected.len());
    assert!(lexer.next().is_none());
}

#[test]
fn simple_tokens() {
    use Token as T;

    let mut lexer = Lexer::new("=(!)<{>}[]==,!=.<=->=+;*/%:");
    let expected = [
        T::Eq,
        T::LParen,
        T::Bang,
        T::RParen,
        T::Lt,
        T::LBrace,
        T::Gt,
        T::RBrace,
        T::LBracket,
        T::RBracket,
        T::EqEq,
        T::Comma,
        T::BangEq,
        T::Dot,
        T::LtEq,
        T::Minus,
        T::GtEq,
        T::Plus,
        T::Semicolon,
        T::Star,
        T::Slash,
        T::Percent,
        T::Colon,
        T::Eof,
    ];

    check_tokens(&mut lexer, &expected);
}

#[test]
fn keywords() {
    use Keyword as K;
    use Token as T;

    let mut lexer = Lexer::new(
        "and class else false for fun if nil or print return super this true var while \
         async await finish future lambda reduce",
    );
    let expected = [
        T::Keyword(K::And),
        T::Keyword(K::Class),
        T::Keyword(K::Else),
        T::Keyword(K::False),
        T::Keyword(K::For),
        T::Keyword(K::Fun),
        T::Keyword(K::If),
        T::Keyword(K::Nil),
        T::Keyword(K::Or),
        T::Keyword(K::Print),
        T::Keyword(K::Return),
        T::Keyword(K::Super),
        T::Keyword(K::This),
        T::Keyword(K::True),
        T::Keyword(K::Var),
        T::Keyword(K::While),
        T::Keyword(K::Async),
        T::Keyword(K::Await),
        T::Keyword(K::Finish),
        T::Keyword(K::Future),
        T::Keyword(K::Lambda),
        T::Keyword(K::Reduce),
        T::Eof,
    ];

    check_tokens(&mut lexer, &expected);
}

#[test]
fn keyword_prefixed_identifiers() {
    use Token as T;

    let mut lexer = Lexer::new("asynchronous finished classy fortune");
    let expected = [
        T::Ident("asynchronous"),
        T::Ident("finished"),
        T::Ident("classy"),
        T::Ident("fortune"),
        T::Eof,
    ];

    check_tokens(&mut lexer, &expected);
}

#[test]
fn numbers() {
    use Token as T;

    let mut lexer = Lexer::new("0 123 3.25 7. .5");
    let expected = [
        T::Number {
            lexeme: "0",
            value: 0.0,
        },
        T::Number {
            lexeme: "123",
            value: 123.0,
        },
        T::Number {
            lexeme: "3.25",
            value: 3.25,
        },
        // `7.` is number then dot, `.5` is dot then number
        T::Number {
            lexeme: "7",
            value: 7.0,
        },
        T::Dot,
        T::Dot,
        T::Number {
            lexeme: "5",
            value: 5.0,
        },
        T::Eof,
    ];

    check_tokens(&mut lexer, &expected);
}

#[test]
fn strings() {
    use Token as T;

    let mut lexer = Lexer::new("\"hello\" \"a b\nc\"");
    let expected = [
        T::String {
            lexeme: "\"hello\"",
            value: "hello",
        },
        T::String {
            lexeme: "\"a b\nc\"",
            value: "a b\nc",
        },
        T::Eof,
    ];

    check_tokens(&mut lexer, &expected);
    assert_eq!(lexer.line(), 2);
}

#[test]
fn unterminated_string() {
    let mut lexer = Lexer::new("var s = \"oops");
    let expected = [
        Ok(Token::Keyword(Keyword::Var)),
        Ok(Token::Ident("s")),
        Ok(Token::Eq),
        Err(LexerTestErr::UnterminatedString),
        Ok(Token::Eof),
    ];

    check_tokens_with_errors(&mut lexer, &expected);
}

#[test]
fn unexpected_character() {
    let mut lexer = Lexer::new("1 + @");
    let expected = [
        Ok(Token::Number {
            lexeme: "1",
            value: 1.0,
        }),
        Ok(Token::Plus),
        Err(LexerTestErr::UnknownCharacter('@')),
        Ok(Token::Eof),
    ];

    check_tokens_with_errors(&mut lexer, &expected);
}

#[test]
fn comments_and_lines() {
    use Token as T;

    let mut lexer = Lexer::new("// intro\nprint 1; // trailing\n// end");
    let expected = [
        T::Keyword(Keyword::Print),
        T::Number {
            lexeme: "1",
            value: 1.0,
        },
        T::Semicolon,
        T::Eof,
    ];

    check_tokens(&mut lexer, &expected);
    assert_eq!(lexer.line(), 3);
}
