//! BlueZ per-device `info` files: a small INI dialect.
//!
//! Parsing keeps section and key order so rewriting a file changes only the
//! keys that were set. Comments and lines that are not `key=value` are kept
//! verbatim in place; blank lines are not.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoFile {
    sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    name: String,
    lines: Vec<Line>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry(String, String),
    Opaque(String),
}

impl InfoFile {
    pub fn parse(text: &str) -> Self {
        let mut file = InfoFile::default();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                file.section_mut(name.trim());
                continue;
            }
            let parsed = match line.split_once('=') {
                Some((key, value)) if !line.starts_with('#') && !line.starts_with(';') => {
                    Line::Entry(key.trim().to_string(), value.trim().to_string())
                }
                _ => Line::Opaque(raw.trim_end().to_string()),
            };
            // lines before any header are kept under an unnamed section
            if file.sections.is_empty() {
                file.section_mut("");
            }
            if let Some(section) = file.sections.last_mut() {
                section.lines.push(parsed);
            }
        }
        file
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|candidate| candidate.name == section)?
            .lines
            .iter()
            .find_map(|line| match line {
                Line::Entry(name, value) if name == key => Some(value.as_str()),
                _ => None,
            })
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        let section = self.section_mut(section);
        let existing = section.lines.iter_mut().find_map(|line| match line {
            Line::Entry(name, current) if name == key => Some(current),
            _ => None,
        });
        match existing {
            Some(current) => *current = value,
            None => section.lines.push(Line::Entry(key.to_string(), value)),
        }
    }

    pub fn set_if_absent(&mut self, section: &str, key: &str, value: impl Into<String>) {
        if self.get(section, key).is_none() {
            self.set(section, key, value);
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            if !section.name.is_empty() {
                out.push_str(&format!("[{}]\n", section.name));
            }
            for line in &section.lines {
                match line {
                    Line::Entry(key, value) => out.push_str(&format!("{}={}\n", key, value)),
                    Line::Opaque(text) => {
                        out.push_str(text);
                        out.push('\n');
                    }
                }
            }
            out.push('\n');
        }
        out
    }

    fn section_mut(&mut self, name: &str) -> &mut Section {
        let index = match self.sections.iter().position(|section| section.name == name) {
            Some(index) => index,
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    lines: Vec::new(),
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXISTING: &str = "[General]\nName=Old Mouse\nClass=0x002580\nTrusted=true\n\n[LinkKey]\nKey=00000000000000000000000000000000\nType=5\nPINLength=0\n\n[DeviceID]\nSource=2\n";

    #[test]
    fn keeps_order_and_replaces_values() {
        let mut info = InfoFile::parse(EXISTING);
        info.set("LinkKey", "Key", "0102030405060708090A0B0C0D0E0F10");
        info.set_if_absent("LinkKey", "Type", "4");
        info.set_if_absent("General", "Name", "New Name");
        let text = info.render();
        assert_eq!(
            text,
            "[General]\nName=Old Mouse\nClass=0x002580\nTrusted=true\n\n\
             [LinkKey]\nKey=0102030405060708090A0B0C0D0E0F10\nType=5\nPINLength=0\n\n\
             [DeviceID]\nSource=2\n\n"
        );
    }

    #[test]
    fn adds_missing_sections_at_end() {
        let mut info = InfoFile::parse("[General]\nName=Keyboard\n");
        info.set("LinkKey", "Key", "AA");
        assert_eq!(info.get("LinkKey", "Key"), Some("AA"));
        assert_eq!(info.render(), "[General]\nName=Keyboard\n\n[LinkKey]\nKey=AA\n\n");
    }

    #[test]
    fn keeps_comments_through_a_rewrite() {
        let mut info = InfoFile::parse(
            "# paired by hand\n[General]\nName=Pad\n; keep trusted\nTrusted=true\n\n[LinkKey]\nKey=FF\n",
        );
        info.set("LinkKey", "Key", "AA");
        assert_eq!(info.get("General", "Trusted"), Some("true"));
        assert_eq!(
            info.render(),
            "# paired by hand\n\n[General]\nName=Pad\n; keep trusted\nTrusted=true\n\n[LinkKey]\nKey=AA\n\n"
        );
    }

    #[test]
    fn commented_out_key_is_not_a_value() {
        let info = InfoFile::parse("[LinkKey]\n#Key=FF\n");
        assert_eq!(info.get("LinkKey", "Key"), None);
        assert_eq!(info.render(), "[LinkKey]\n#Key=FF\n\n");
    }

    #[test]
    fn tolerates_empty_and_headerless_input() {
        assert_eq!(InfoFile::parse("").render(), "");
        let info = InfoFile::parse("Name=orphan\n");
        assert_eq!(info.get("", "Name"), Some("orphan"));
    }
}
