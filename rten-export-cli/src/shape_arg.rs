/// Specifies the shape of a program input.
#[derive(Clone, Debug, PartialEq)]
pub struct InputShape {
    /// Name of the input, as shown in the program's signature.
    pub input_name: String,

    pub shape: Vec<usize>,
}

impl InputShape {
    /// Parse a shape specifier in the form `input_name=AxBxC`.
    ///
    /// The input name can be quoted if it contains `=` characters.
    pub fn parse(spec: &str) -> Result<InputShape, ParseError> {
        let tokens = tokenize(spec);
        let Some(eq_pos) = tokens.iter().position(|tok| matches!(tok, Token::Equals)) else {
            return Err(ParseError::new(
                spec,
                ParseErrorKind::InvalidFormat {
                    message: "expected <name>=<shape> but no '=' was found".into(),
                },
            ));
        };

        let (name_spec, shape_spec) = tokens.split_at(eq_pos);

        let [Token::Equals, Token::Text(shape_str)] = shape_spec else {
            return Err(ParseError::new(
                spec,
                ParseErrorKind::InvalidFormat {
                    message: "expected specifier to end with '=<shape>'".into(),
                },
            ));
        };

        let [Token::Text(input_name)] = name_spec else {
            return Err(ParseError::new(spec, ParseErrorKind::InvalidName));
        };

        let shape = shape_str
            .split('x')
            .map(|size| size.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ParseError::new(spec, ParseErrorKind::InvalidSize))?;

        Ok(InputShape {
            input_name: input_name.to_string(),
            shape,
        })
    }

    /// Sort entries by input name and remove duplicates.
    ///
    /// When an input is given more than once, the last entry wins.
    pub fn sort_dedup(shapes: &mut Vec<InputShape>) {
        shapes.reverse();
        // Stable sort keeps later entries first within each name.
        shapes.sort_by(|a, b| a.input_name.cmp(&b.input_name));
        shapes.dedup_by(|a, b| a.input_name == b.input_name);
    }
}

enum Token {
    Equals,
    Text(String),
}

fn tokenize(spec: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut in_quote = false;

    for ch in spec.chars() {
        match ch {
            '=' if !in_quote => {
                tokens.push(Token::Equals);
            }
            '"' => in_quote = !in_quote,
            ch => match tokens.last_mut() {
                Some(Token::Text(text)) => text.push(ch),
                _ => tokens.push(Token::Text(ch.into())),
            },
        }
    }

    tokens
}

#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::enum_variant_names)] // Don't warn about all variants having "Invalid" prefix.
enum ParseErrorKind {
    /// Shape spec doesn't match "name=shape"
    InvalidFormat { message: String },
    /// Shape spec has an invalid input name
    InvalidName,
    /// Shape spec has an invalid dimension size
    InvalidSize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParseError {
    spec: String,
    kind: ParseErrorKind,
}

impl ParseError {
    fn new(spec: &str, kind: ParseErrorKind) -> ParseError {
        ParseError {
            spec: spec.to_string(),
            kind,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ParseErrorKind::InvalidFormat { message } => write!(
                fmt,
                "invalid format for input shape spec \"{}\": {}",
                self.spec, message
            ),
            ParseErrorKind::InvalidName => {
                write!(fmt, "invalid name in input shape spec \"{}\"", self.spec)
            }
            ParseErrorKind::InvalidSize => write!(
                fmt,
                "invalid shape in \"{}\". Sizes must be non-negative integers separated by 'x'.",
                self.spec
            ),
        }
    }
}

impl std::error::Error for ParseError {}
