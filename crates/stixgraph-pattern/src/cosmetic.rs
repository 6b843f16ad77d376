//! Cosmetic passes over rendered filter text. Both skip string literals.

/// Quote tracking shared by the passes below.
#[derive(Default)]
struct Quotes {
    open: Option<char>,
    escaped: bool,
}

impl Quotes {
    /// Returns true if `c` is part of a string literal.
    fn step(&mut self, c: char) -> bool {
        match self.open {
            Some(q) => {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == q {
                    self.open = None;
                }
                true
            }
            None if c == '"' || c == '\'' => {
                self.open = Some(c);
                true
            }
            None => false,
        }
    }
}

/// Removes a parenthesis pair whose only content is another parenthesised
/// group, so `((a))` becomes `(a)`.
///
/// Every character is pushed on a stack; a `)` whose stack top is an
/// unconsumed `(` closes a pair that wraps nothing but already-closed groups.
pub fn remove_redundant_parentheses(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut removable = vec![false; chars.len()];
    // (position, is_open_paren)
    let mut stack: Vec<(usize, bool)> = Vec::new();
    let mut quotes = Quotes::default();

    for (i, &c) in chars.iter().enumerate() {
        let in_string = quotes.step(c);
        if in_string || c != ')' {
            stack.push((i, !in_string && c == '('));
            continue;
        }
        if let Some(&(open, true)) = stack.last() {
            removable[open] = true;
            removable[i] = true;
            stack.pop();
            continue;
        }
        while let Some((_, is_open)) = stack.pop() {
            if is_open {
                break;
            }
        }
    }

    chars
        .iter()
        .zip(removable)
        .filter(|(_, drop)| !drop)
        .map(|(c, _)| *c)
        .collect()
}

/// Collapses whitespace runs to one space and drops spaces just inside
/// parentheses.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quotes = Quotes::default();
    let mut pending_space = false;

    for c in text.chars() {
        let was_in_string = quotes.open.is_some();
        let in_string = quotes.step(c);
        if !in_string && c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            let closes = !was_in_string && c == ')';
            if !out.is_empty() && !out.ends_with('(') && !closes {
                out.push(' ');
            }
            pending_space = false;
        }
        out.push(c);
    }
    out
}

/// Both passes, in the order the compiler applies them.
pub fn tidy(text: &str) -> String {
    normalize_whitespace(&remove_redundant_parentheses(text))
}
