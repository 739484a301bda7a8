//! Known mixed-case terms that CAMELCASE_SPLIT must leave alone.
//!
//! The built-in list covers brand and technical names that routinely appear
//! in converted papers. Operators extend it with `[repair].extra_terms` or a
//! one-term-per-line `[repair].dictionary_path` file (`#` starts a comment).

use std::collections::HashSet;
use std::path::Path;

const BUILTIN_TERMS: &[&str] = &[
    // Products and platforms
    "iPhone", "iPad", "iPod", "iMac", "iCloud", "iTunes", "iOS", "macOS", "tvOS", "watchOS",
    "eBay", "eBook", "eMail", "ePub", "YouTube", "GitHub", "GitLab", "LinkedIn", "PayPal",
    "WordPress", "PowerPoint", "OneDrive", "SharePoint", "MacBook", "PlayStation", "DeepMind",
    "OpenAI", "ChatGPT", "WhatsApp", "FaceTime", "DuckDuckGo", "StackOverflow", "BitTorrent",
    // Languages, formats, tooling
    "JavaScript", "TypeScript", "CoffeeScript", "PostScript", "PostgreSQL", "MySQL", "SQLite",
    "MongoDB", "NoSQL", "GraphQL", "LaTeX", "BibTeX", "TeX", "MATLAB", "NumPy", "SciPy",
    "PyTorch", "TensorFlow", "OpenGL", "WebGL", "WebAssembly", "WiFi", "DevOps", "McAfee",
    // Academic
    "PhD", "PhDs", "MSc", "BSc", "MSci", "DPhil", "MBA", "pH", "mRNA", "tRNA", "rRNA", "miRNA",
    "siRNA", "kDa", "mAh", "kWh", "MHz", "GHz", "kHz",
];

#[derive(Debug, Clone)]
pub struct Dictionary {
    terms: HashSet<String>,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Dictionary {
    pub fn builtin() -> Self {
        Self {
            terms: BUILTIN_TERMS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Add operator-supplied terms. Blank entries are ignored.
    pub fn with_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for term in terms {
            let term = term.as_ref().trim();
            if !term.is_empty() {
                self.terms.insert(term.to_string());
            }
        }
        self
    }

    /// Add every term listed in `path`.
    pub fn load_file(self, path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let terms = content
            .lines()
            .map(|l| l.split('#').next().unwrap_or("").trim())
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        Ok(self.with_terms(terms))
    }

    /// Case-sensitive membership, also accepting plural and possessive forms
    /// of a listed term (`iPhones`, `GitHub's`).
    pub fn contains(&self, token: &str) -> bool {
        if self.terms.contains(token) {
            return true;
        }
        ["'s", "’s", "es", "s"]
            .iter()
            .filter_map(|suffix| token.strip_suffix(suffix))
            .any(|stem| self.terms.contains(stem))
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_terms_are_case_sensitive() {
        let d = Dictionary::builtin();
        assert!(d.contains("iPhone"));
        assert!(!d.contains("Iphone"));
        assert!(!d.contains("helloWorld"));
    }

    #[test]
    fn plural_and_possessive_forms() {
        let d = Dictionary::builtin();
        assert!(d.contains("iPhones"));
        assert!(d.contains("GitHub's"));
        assert!(d.contains("MacBooks"));
    }

    #[test]
    fn extra_terms_extend_the_list() {
        let d = Dictionary::builtin().with_terms(["FooBar", "  ", "deBruijn"]);
        assert!(d.contains("FooBar"));
        assert!(d.contains("deBruijn"));
        assert_eq!(d.len(), Dictionary::builtin().len() + 2);
    }

    #[test]
    fn load_file_skips_comments() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# project names").unwrap();
        writeln!(f, "QuickSilver").unwrap();
        writeln!(f, "NetBSD  # trailing comment").unwrap();
        let d = Dictionary::builtin().load_file(f.path()).unwrap();
        assert!(d.contains("QuickSilver"));
        assert!(d.contains("NetBSD"));
    }
}
