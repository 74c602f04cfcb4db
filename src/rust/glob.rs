// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Shell-style wildcard matching for debugger rules.
//!
//! Supports `*` (any run of characters), `?` (one character), `[abc]`, `[a-z]` and `[!abc]` classes, and `\` to
//! escape the next character. A pattern must match the whole input.

//======================================================================================================================
// Constants
//======================================================================================================================

/// Upper bound on matching steps, so that patterns like `*a*a*a*a*b` cannot stall the debugger thread.
const MAX_MATCH_STEPS: usize = 100_000;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Matches `input` against `pattern`. Exceeding the step bound counts as a mismatch.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();
    let mut steps: usize = 0;
    match_from(&pattern, 0, &input, 0, &mut steps)
}

fn match_from(pattern: &[char], mut pi: usize, input: &[char], mut ii: usize, steps: &mut usize) -> bool {
    loop {
        *steps += 1;
        if *steps > MAX_MATCH_STEPS {
            return false;
        }
        if pi == pattern.len() {
            return ii == input.len();
        }
        match pattern[pi] {
            '*' => {
                while pi < pattern.len() && pattern[pi] == '*' {
                    pi += 1;
                }
                if pi == pattern.len() {
                    return true;
                }
                return (ii..=input.len()).any(|start| match_from(pattern, pi, input, start, steps));
            },
            '?' => {
                if ii == input.len() {
                    return false;
                }
                pi += 1;
                ii += 1;
            },
            '[' => {
                if ii == input.len() {
                    return false;
                }
                match match_class(&pattern[pi..], input[ii]) {
                    Some((true, len)) => {
                        pi += len;
                        ii += 1;
                    },
                    Some((false, _)) => return false,
                    // Unterminated class: treat the bracket literally.
                    None => {
                        if input[ii] != '[' {
                            return false;
                        }
                        pi += 1;
                        ii += 1;
                    },
                }
            },
            '\\' if pi + 1 < pattern.len() => {
                if ii == input.len() || pattern[pi + 1] != input[ii] {
                    return false;
                }
                pi += 2;
                ii += 1;
            },
            c => {
                if ii == input.len() || c != input[ii] {
                    return false;
                }
                pi += 1;
                ii += 1;
            },
        }
    }
}

/// Parses the class at the start of `pattern` and matches `ch` against it. Returns whether it matched and how many
/// pattern characters the class spans, or `None` if the class is not terminated.
fn match_class(pattern: &[char], ch: char) -> Option<(bool, usize)> {
    let mut idx: usize = 1;
    let negate: bool = matches!(pattern.get(idx), Some('!') | Some('^'));
    if negate {
        idx += 1;
    }
    let first: usize = idx;
    let mut matched: bool = false;
    while idx < pattern.len() {
        let c: char = pattern[idx];
        // A leading ']' is a literal.
        if c == ']' && idx > first {
            return Some((matched != negate, idx + 1));
        }
        if idx + 2 < pattern.len() && pattern[idx + 1] == '-' && pattern[idx + 2] != ']' {
            if c <= ch && ch <= pattern[idx + 2] {
                matched = true;
            }
            idx += 3;
            continue;
        }
        if c == ch {
            matched = true;
        }
        idx += 1;
    }
    None
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::glob_match;

    #[test]
    fn test_wildcards() {
        assert!(glob_match("*", ""));
        assert!(glob_match("mod::system/*.whscr", "mod::system/scripts/run.whscr"));
        assert!(glob_match("job?.whscr", "job1.whscr"));
        assert!(!glob_match("job?.whscr", "job.whscr"));
        assert!(!glob_match("*.whlib", "run.whscr"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }

    #[test]
    fn test_classes_and_escapes() {
        assert!(glob_match("[abc]x", "bx"));
        assert!(glob_match("[a-c]x", "cx"));
        assert!(!glob_match("[!a-c]x", "cx"));
        assert!(glob_match("[]]", "]"));
        assert!(glob_match("\\*", "*"));
        assert!(!glob_match("\\*", "a"));
        assert!(glob_match("[abc", "[abc"));
    }

    #[test]
    fn test_pathological_pattern_terminates() {
        let input: String = "a".repeat(64);
        assert!(!glob_match("*a*a*a*a*a*a*a*a*b", &input));
    }
}
