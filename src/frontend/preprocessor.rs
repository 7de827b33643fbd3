use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Module names that resolve to "no file": their symbols are supplied by
/// the syscall layer, so the directive is simply dropped.
const BUILTIN_MODULES: &[&str] = &[
    "math", "math.h", "cmath", "sys", "stdlib.h", "cstdlib", "time", "time.h", "ctime",
    "iostream", "stdio.h", "vector", "string", "map",
];

/// Candidate file extensions tried when the module name carries none.
const CANDIDATE_SUFFIXES: &[&str] = &[
    "/__init__.soul",
    "/__init__.py",
    ".soul",
    ".py",
    ".h",
    ".c",
    ".cpp",
    ".hpp",
    ".cc",
    ".hh",
];

/// Resolves `import` and `#include` directives before lexing.
///
/// Each directive is replaced by the (recursively preprocessed) text of
/// the resolved file. `import` bodies are bracketed with `__module__ X` /
/// `__endmodule__` markers so the compiler can prefix the inlined
/// top-level names. A set of already-included paths makes inclusion
/// idempotent within one run.
pub struct Preprocessor {
    include_paths: Vec<PathBuf>,
    included: HashSet<PathBuf>,
}

impl Preprocessor {
    pub fn new() -> Self {
        Preprocessor {
            include_paths: Vec::new(),
            included: HashSet::new(),
        }
    }

    /// Adds a directory to the search list (the driver's `-I` flag).
    pub fn add_include_path(&mut self, path: impl Into<PathBuf>) {
        self.include_paths.push(path.into());
    }

    pub fn preprocess(&mut self, source: &str, current_dir: &Path) -> String {
        let mut result = String::new();

        for line in source.lines() {
            // Directives are only recognized at column zero.
            if let Some(rest) = line.strip_prefix("import ") {
                self.expand_directive(&mut result, rest, true, current_dir, line);
                continue;
            }
            if line.starts_with("#include") {
                let rest = &line["#include".len()..];
                self.expand_directive(&mut result, rest, false, current_dir, line);
                continue;
            }
            result.push_str(line);
            result.push('\n');
        }
        result
    }

    fn expand_directive(
        &mut self,
        result: &mut String,
        rest: &str,
        is_import: bool,
        current_dir: &Path,
        original_line: &str,
    ) {
        let module = if is_import {
            reduce_import_clause(rest)
        } else {
            match extract_include_name(rest) {
                Some(m) => m,
                None => return,
            }
        };

        if module.is_empty() || BUILTIN_MODULES.contains(&module.as_str()) {
            return;
        }

        let candidates = candidate_names(&module);
        let search_paths = self.search_paths(current_dir);

        for dir in &search_paths {
            for name in &candidates {
                let full = dir.join(name);
                if self.included.contains(&full) {
                    result.push_str(&format!("// Skipped {}\n", full.display()));
                    return;
                }
                let Ok(body) = fs::read_to_string(&full) else {
                    continue;
                };
                self.included.insert(full.clone());
                let parent = full.parent().map(Path::to_path_buf).unwrap_or_default();
                if is_import {
                    result.push_str(&format!("__module__ {}\n", module));
                    result.push_str(&self.preprocess(&body, &parent));
                    result.push_str("\n__endmodule__\n");
                } else {
                    result.push_str(&self.preprocess(&body, &parent));
                    result.push('\n');
                }
                return;
            }
        }

        // Unresolved: comment out includes so the line survives for
        // diagnostics; imports are dropped entirely.
        if !is_import {
            result.push_str(&format!("// {}\n", original_line));
        }
    }

    fn search_paths(&self, current_dir: &Path) -> Vec<PathBuf> {
        let mut paths = vec![current_dir.to_path_buf(), PathBuf::from(".")];
        for fixed in ["packages", "site-packages", "lib", "src", "include"] {
            paths.push(PathBuf::from(fixed));
        }
        paths.extend(self.include_paths.iter().cloned());
        if let Ok(env_path) = std::env::var("C_INCLUDE_PATH") {
            paths.push(PathBuf::from(env_path));
        }
        if let Ok(pkg_path) = std::env::var("SOUL_PACKAGES") {
            paths.push(PathBuf::from(pkg_path));
        }
        paths
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduces the clause after `import` to a bare module name.
///
/// `import x as y` and `import x.mod import z` keep the left side;
/// `from x import y` keeps the part after `from`.
fn reduce_import_clause(clause: &str) -> String {
    let mut module = clause.to_string();
    if let Some(as_pos) = module.find(" as ") {
        module.truncate(as_pos);
    } else if let Some(from_pos) = module.find(" from ") {
        module = module[from_pos + 6..].to_string();
    } else if let Some(import_pos) = module.find(" import ") {
        module.truncate(import_pos);
    }
    module.retain(|c| !c.is_whitespace());
    module
}

/// Pulls the file name out of `#include "x"` / `#include <x>`.
fn extract_include_name(rest: &str) -> Option<String> {
    let start = rest.find(|c| c == '"' || c == '<')?;
    let end = rest.rfind(|c| c == '"' || c == '>')?;
    if end <= start {
        return None;
    }
    Some(rest[start + 1..end].to_string())
}

fn candidate_names(module: &str) -> Vec<String> {
    if module.contains('.') {
        // Extension already present: try verbatim only.
        vec![module.to_string()]
    } else {
        CANDIDATE_SUFFIXES
            .iter()
            .map(|suffix| format!("{}{}", module, suffix))
            .collect()
    }
}
