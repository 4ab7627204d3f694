//! Static validation of user script source.
//!
//! Upload-time safety checks run before a script is ever persisted:
//! - an entry symbol `generate_decisions` taking a single argument exists
//! - imports come from the fixed whitelist of pure computational modules
//! - no relative imports, no dynamic code-loading primitives
//! - no reflection into double-underscore attributes
//!
//! The checks operate on the source with comments and string literals
//! blanked out, so user data can't smuggle constructs past the scan and
//! string contents can't trip false positives. Runtime enforcement (the
//! import hook and restricted builtins inside the worker) backs these
//! checks up; validation exists to fail fast at upload.

use thiserror::Error;

/// Modules a script may import.
pub const IMPORT_WHITELIST: [&str; 4] = ["math", "statistics", "random", "econ_api"];

/// Callables whose presence rejects the script outright.
const FORBIDDEN_CALLS: [&str; 13] = [
    "eval",
    "exec",
    "compile",
    "__import__",
    "open",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "input",
    "breakpoint",
];

#[derive(Debug, Error, PartialEq)]
pub enum ScriptValidationError {
    #[error("script must define `generate_decisions` taking a single argument")]
    MissingEntryPoint,

    #[error("`generate_decisions` must take exactly one argument, found {0}")]
    EntryPointArity(usize),

    #[error("import of '{0}' is not in the whitelist")]
    ForbiddenImport(String),

    #[error("relative imports are not permitted")]
    RelativeImport,

    #[error("call to forbidden primitive '{0}'")]
    ForbiddenCall(String),

    #[error("access to double-underscore attribute '{0}'")]
    DunderAttribute(String),
}

/// All violations found, or `Ok(())`.
pub type ValidationResult = Result<(), Vec<ScriptValidationError>>;

/// Validate script source before storage.
pub fn validate_script(code: &str) -> ValidationResult {
    let stripped = strip_comments_and_strings(code);
    let mut errors = Vec::new();

    check_entry_point(&stripped, &mut errors);
    check_imports(&stripped, &mut errors);
    check_forbidden_calls(&stripped, &mut errors);
    check_dunder_attributes(&stripped, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Blank out comments and string literal contents, preserving newlines so
/// line-oriented checks keep working.
fn strip_comments_and_strings(code: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        Comment,
        Str { quote: char, triple: bool },
    }

    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut state = State::Normal;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match &state {
            State::Normal => {
                if c == '#' {
                    state = State::Comment;
                    out.push(' ');
                } else if c == '"' || c == '\'' {
                    let triple = i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
                    if triple {
                        i += 2;
                    }
                    state = State::Str { quote: c, triple };
                    out.push(' ');
                } else {
                    out.push(c);
                }
            }
            State::Comment => {
                if c == '\n' {
                    state = State::Normal;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::Str { quote, triple } => {
                if c == '\\' {
                    i += 1; // skip the escaped character
                } else if c == *quote {
                    if *triple {
                        if i + 2 < chars.len() && chars[i + 1] == *quote && chars[i + 2] == *quote {
                            i += 2;
                            state = State::Normal;
                        }
                    } else {
                        state = State::Normal;
                    }
                } else if c == '\n' {
                    out.push('\n');
                }
                // String contents and quotes become blanks (nothing pushed).
            }
        }
        i += 1;
    }
    out
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn check_entry_point(stripped: &str, errors: &mut Vec<ScriptValidationError>) {
    const NEEDLE: &str = "def generate_decisions";
    let Some(pos) = stripped.find(NEEDLE) else {
        errors.push(ScriptValidationError::MissingEntryPoint);
        return;
    };
    let rest = &stripped[pos + NEEDLE.len()..];
    let rest = rest.trim_start();
    if !rest.starts_with('(') {
        errors.push(ScriptValidationError::MissingEntryPoint);
        return;
    }

    // Count top-level parameters inside the parentheses.
    let mut depth = 0usize;
    let mut current = String::new();
    let mut params: Vec<String> = Vec::new();
    for c in rest.chars() {
        match c {
            '(' | '[' | '{' => {
                if depth > 0 {
                    current.push(c);
                }
                depth += 1;
            }
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
                current.push(c);
            }
            ',' if depth == 1 => {
                params.push(current.trim().to_string());
                current.clear();
            }
            _ => {
                if depth > 0 {
                    current.push(c);
                }
            }
        }
    }
    if !current.trim().is_empty() {
        params.push(current.trim().to_string());
    }
    let arity = params.iter().filter(|p| !p.is_empty()).count();
    if arity != 1 {
        errors.push(ScriptValidationError::EntryPointArity(arity));
    }
}

fn check_imports(stripped: &str, errors: &mut Vec<ScriptValidationError>) {
    for line in stripped.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("import ") {
            // `import a.b as c, d`: validate every comma-separated root.
            for part in rest.split(',') {
                let name = part.split_whitespace().next().unwrap_or("");
                check_module_root(name, errors);
            }
        } else if let Some(rest) = trimmed.strip_prefix("from ") {
            let module = rest.split_whitespace().next().unwrap_or("");
            if module.starts_with('.') {
                if !errors.contains(&ScriptValidationError::RelativeImport) {
                    errors.push(ScriptValidationError::RelativeImport);
                }
            } else {
                check_module_root(module, errors);
            }
        }
    }
}

fn check_module_root(name: &str, errors: &mut Vec<ScriptValidationError>) {
    if name.is_empty() {
        return;
    }
    let root = name.split('.').next().unwrap_or(name);
    if !IMPORT_WHITELIST.contains(&root) {
        let err = ScriptValidationError::ForbiddenImport(root.to_string());
        if !errors.contains(&err) {
            errors.push(err);
        }
    }
}

fn check_forbidden_calls(stripped: &str, errors: &mut Vec<ScriptValidationError>) {
    let bytes: Vec<char> = stripped.chars().collect();
    for name in FORBIDDEN_CALLS {
        let mut search = 0;
        while let Some(found) = stripped[search..].find(name) {
            let start = search + found;
            let end = start + name.len();
            search = end;

            let char_start = stripped[..start].chars().count();
            let before_ok = char_start == 0 || !is_ident_char(bytes[char_start - 1]);
            // Attribute access like `obj.open(` is a method call on user
            // data, not the builtin; only bare names are rejected.
            let not_attribute = char_start == 0 || bytes[char_start - 1] != '.';
            let after = stripped[end..].trim_start();
            if before_ok && not_attribute && after.starts_with('(') {
                let err = ScriptValidationError::ForbiddenCall(name.to_string());
                if !errors.contains(&err) {
                    errors.push(err);
                }
                break;
            }
        }
    }
}

fn check_dunder_attributes(stripped: &str, errors: &mut Vec<ScriptValidationError>) {
    let mut search = 0;
    while let Some(found) = stripped[search..].find(".__") {
        let start = search + found;
        let attr: String = stripped[start + 1..]
            .chars()
            .take_while(|c| is_ident_char(*c))
            .collect();
        search = start + 3;
        let err = ScriptValidationError::DunderAttribute(attr);
        if !errors.contains(&err) {
            errors.push(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
import math
from statistics import mean

def generate_decisions(context):
    budget = math.sqrt(context["entity_state"]["cash"])
    return {"households": {context["entity_id"]: {"consumption_budget": budget}}}
"#;

    #[test]
    fn accepts_whitelisted_script() {
        validate_script(VALID).unwrap();
    }

    #[test]
    fn rejects_missing_entry_point() {
        let errs = validate_script("import math\n").unwrap_err();
        assert!(errs.contains(&ScriptValidationError::MissingEntryPoint));
    }

    #[test]
    fn rejects_wrong_arity() {
        let errs = validate_script("def generate_decisions(a, b):\n    return {}\n").unwrap_err();
        assert_eq!(errs, vec![ScriptValidationError::EntryPointArity(2)]);
    }

    #[test]
    fn rejects_forbidden_import() {
        let errs =
            validate_script("import os\n\ndef generate_decisions(ctx):\n    return {}\n")
                .unwrap_err();
        assert!(errs.contains(&ScriptValidationError::ForbiddenImport("os".to_string())));
    }

    #[test]
    fn rejects_submodule_of_forbidden_root() {
        let errs = validate_script(
            "from os.path import join\n\ndef generate_decisions(ctx):\n    return {}\n",
        )
        .unwrap_err();
        assert!(errs.contains(&ScriptValidationError::ForbiddenImport("os".to_string())));
    }

    #[test]
    fn rejects_relative_import() {
        let errs = validate_script(
            "from . import helpers\n\ndef generate_decisions(ctx):\n    return {}\n",
        )
        .unwrap_err();
        assert!(errs.contains(&ScriptValidationError::RelativeImport));
    }

    #[test]
    fn rejects_eval_and_dunder() {
        let errs = validate_script(
            "def generate_decisions(ctx):\n    eval(\"1\")\n    return ctx.__class__\n",
        )
        .unwrap_err();
        assert!(errs.contains(&ScriptValidationError::ForbiddenCall("eval".to_string())));
        assert!(errs.contains(&ScriptValidationError::DunderAttribute("__class__".to_string())));
    }

    #[test]
    fn string_contents_do_not_trip_the_scan() {
        let code = "def generate_decisions(ctx):\n    note = \"please eval(this) import os\"\n    return {}\n";
        validate_script(code).unwrap();
    }

    #[test]
    fn comments_do_not_trip_the_scan() {
        let code = "def generate_decisions(ctx):\n    # eval(os.__dict__)\n    return {}\n";
        validate_script(code).unwrap();
    }

    #[test]
    fn method_named_open_is_not_the_builtin() {
        let code = "def generate_decisions(ctx):\n    ctx.get(\"x\")\n    return {}\n";
        validate_script(code).unwrap();
    }

    #[test]
    fn collects_multiple_errors() {
        let errs = validate_script("import os\nimport sys\n").unwrap_err();
        assert!(errs.len() >= 3); // two imports + missing entry point
    }
}
