//! Model-description editing.
//!
//! The `.feb` model format is XML. Edits are made by locating elements in the
//! raw text and splicing new values in place, so everything outside the
//! touched leaves (comments, formatting, encoding declaration) is preserved
//! byte for byte.

use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::OnceLock;

use ff_types::{FitResult, ModelError, ParameterVector};
use regex::Regex;
use tracing::debug;

/// Writes candidate parameters into a model description and reroutes its
/// output channels.
pub trait ParameterInjector {
    /// Copy `template` to `destination`, overwriting each named coefficient.
    fn write_parameters(&self, template: &Path, destination: &Path, params: &ParameterVector) -> FitResult<()>;

    /// Point the output channel `<channel_tag data="channel_name">` at `new_path`.
    fn redirect_output(
        &self,
        description: &Path,
        channel_tag: &str,
        channel_name: &str,
        new_path: &Path,
    ) -> FitResult<()>;

    /// Sorted unique entity ids referenced by a named region.
    fn extract_entity_ids(&self, description: &Path, region: &str) -> FitResult<Vec<i64>>;

    /// Current numeric value of each named coefficient.
    fn read_parameters(&self, description: &Path, names: &[String]) -> FitResult<BTreeMap<String, f64>>;
}

/// [`ParameterInjector`] for FEBio `.feb` files
#[derive(Debug, Clone)]
pub struct FebInjector {
    material_id: String,
}

impl Default for FebInjector {
    fn default() -> Self {
        Self::new("1")
    }
}

impl FebInjector {
    pub fn new(material_id: impl Into<String>) -> Self {
        Self {
            material_id: material_id.into(),
        }
    }

    pub fn material_id(&self) -> &str {
        &self.material_id
    }

    fn material(&self, text: &str) -> FitResult<Element> {
        find_elements(text, 0..text.len(), "material")?
            .into_iter()
            .find(|e| e.attr("id") == Some(self.material_id.as_str()))
            .ok_or_else(|| {
                ModelError::MaterialNotFound {
                    material_id: self.material_id.clone(),
                }
                .into()
            })
    }

    /// Direct child `<name>` of the material; nested elements of the same
    /// name belong to sub-materials and are skipped.
    fn coefficient(&self, text: &str, material: &Element, name: &str) -> FitResult<Element> {
        find_elements(text, material.inner.clone(), name)?
            .into_iter()
            .find(|leaf| at_top_level(&text[material.inner.start..leaf.start]))
            .ok_or_else(|| {
                ModelError::ElementNotFound {
                    tag: name.to_string(),
                    container: format!("material id={}", self.material_id),
                }
                .into()
            })
    }
}

impl ParameterInjector for FebInjector {
    fn write_parameters(&self, template: &Path, destination: &Path, params: &ParameterVector) -> FitResult<()> {
        let mut doc = ModelText::read(template)?;
        let material = self.material(&doc.text)?;

        let mut edits = Vec::with_capacity(params.len());
        for (name, value) in params.iter() {
            let leaf = self.coefficient(&doc.text, &material, name)?;
            edits.push((leaf.inner.clone(), format_value(value)));
        }
        apply_edits(&mut doc.text, edits);

        doc.write(destination)?;
        debug!("Wrote {} coefficients to {}", params.len(), destination.display());
        Ok(())
    }

    fn redirect_output(
        &self,
        description: &Path,
        channel_tag: &str,
        channel_name: &str,
        new_path: &Path,
    ) -> FitResult<()> {
        let mut doc = ModelText::read(description)?;
        let text = &doc.text;

        let mut logfile = find_elements(text, 0..text.len(), "logfile")?;
        if logfile.is_empty() {
            logfile = find_elements(text, 0..text.len(), "Logfile")?;
        }
        let section = logfile.into_iter().next().ok_or_else(|| ModelError::ElementNotFound {
            tag: "logfile".to_string(),
            container: description.display().to_string(),
        })?;

        // The solver resolves the file relative to its working directory
        let file_name = new_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| new_path.display().to_string());

        let edits: Vec<(Range<usize>, String)> = find_elements(text, section.inner.clone(), channel_tag)?
            .iter()
            .filter(|e| e.attr("data") == Some(channel_name))
            .map(|e| e.set_attr_edit("file", &file_name))
            .collect();

        if edits.is_empty() {
            return Err(ModelError::ChannelNotFound {
                tag: channel_tag.to_string(),
                channel: channel_name.to_string(),
            }
            .into());
        }

        apply_edits(&mut doc.text, edits);
        doc.write(description)?;
        debug!("Redirected <{} data=\"{}\"> to {}", channel_tag, channel_name, file_name);
        Ok(())
    }

    fn extract_entity_ids(&self, description: &Path, region: &str) -> FitResult<Vec<i64>> {
        let text = ModelText::read(description)?.text;
        let surface = find_elements(&text, 0..text.len(), "Surface")?
            .into_iter()
            .find(|e| e.attr("name") == Some(region))
            .ok_or_else(|| ModelError::RegionNotFound {
                region: region.to_string(),
            })?;

        // Only element-content lines such as `<quad4 id="3">5,35,522,108</quad4>`
        // carry ids; the tag attributes are skipped.
        let mut ids: Vec<i64> = text[surface.inner.clone()]
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('<') && line.contains('>') && line.contains("</"))
            .filter_map(|line| {
                let start = line.find('>')? + 1;
                let end = line.rfind('<')?;
                (start <= end).then(|| &line[start..end])
            })
            .flat_map(|content| integer_pattern().find_iter(content))
            .filter_map(|m| m.as_str().parse::<i64>().ok())
            .collect();

        ids.sort_unstable();
        ids.dedup();
        debug!("Region '{}' references {} entities", region, ids.len());
        Ok(ids)
    }

    fn read_parameters(&self, description: &Path, names: &[String]) -> FitResult<BTreeMap<String, f64>> {
        let text = ModelText::read(description)?.text;
        let material = self.material(&text)?;

        names
            .iter()
            .map(|name| -> FitResult<(String, f64)> {
                let leaf = self.coefficient(&text, &material, name)?;
                let raw = text[leaf.inner].trim();
                let value = raw.parse::<f64>().map_err(|_| ModelError::NotNumeric {
                    tag: name.clone(),
                    text: raw.to_string(),
                })?;
                Ok((name.clone(), value))
            })
            .collect()
    }
}

fn integer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+").expect("static integer pattern"))
}

fn attribute_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w:.-]*)\s*=\s*"([^"]*)""#).expect("static attribute pattern")
    })
}

/// Document text plus the encoding needed to write it back unchanged.
#[derive(Debug)]
struct ModelText {
    text: String,
    latin1: bool,
}

impl ModelText {
    /// UTF-8 when the bytes allow it, otherwise ISO-8859-1, which maps every
    /// byte to exactly one char.
    fn read(path: &Path) -> FitResult<Self> {
        let bytes = fs::read(path)?;
        Ok(match String::from_utf8(bytes) {
            Ok(text) => Self { text, latin1: false },
            Err(e) => Self {
                text: e.into_bytes().into_iter().map(char::from).collect(),
                latin1: true,
            },
        })
    }

    fn into_bytes(self) -> Vec<u8> {
        if !self.latin1 {
            return self.text.into_bytes();
        }
        let mut bytes = Vec::with_capacity(self.text.len());
        for c in self.text.chars() {
            match u8::try_from(c) {
                Ok(b) => bytes.push(b),
                // Only spliced values can hold these; keep them as references.
                Err(_) => bytes.extend_from_slice(format!("&#x{:X};", u32::from(c)).as_bytes()),
            }
        }
        bytes
    }

    fn write(self, path: &Path) -> FitResult<()> {
        fs::write(path, self.into_bytes())?;
        Ok(())
    }
}

/// Shortest round-trip text, switching to exponent form for very small or
/// very large magnitudes.
fn format_value(value: f64) -> String {
    let magnitude = value.abs();
    if value == 0.0 || (1e-4..1e6).contains(&magnitude) {
        format!("{value}")
    } else {
        format!("{value:e}")
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Splice replacements into `text`, last span first so offsets stay valid.
fn apply_edits(text: &mut String, mut edits: Vec<(Range<usize>, String)>) {
    edits.sort_by(|a, b| b.0.start.cmp(&a.0.start));
    for (range, replacement) in edits {
        text.replace_range(range, &replacement);
    }
}

#[derive(Debug, Clone)]
struct Attr {
    name: String,
    value: String,
    value_span: Range<usize>,
}

/// Byte offsets of one element inside the document text
#[derive(Debug, Clone)]
struct Element {
    /// Offset of the `<` opening the start tag.
    start: usize,
    /// Offset of the `>` closing the start tag (or of `/` in `/>`).
    open_end: usize,
    inner: Range<usize>,
    attrs: Vec<Attr>,
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|a| a.name == name).map(|a| a.value.as_str())
    }

    fn set_attr_edit(&self, name: &str, value: &str) -> (Range<usize>, String) {
        let escaped = escape_attr(value);
        match self.attrs.iter().find(|a| a.name == name) {
            Some(attr) => (attr.value_span.clone(), escaped),
            None => (self.open_end..self.open_end, format!(" {name}=\"{escaped}\"")),
        }
    }
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<!--.*?-->|<[?!][^>]*>|<(/?)[A-Za-z_][^>]*?(/?)>").expect("static tag pattern")
    })
}

/// Whether an element starting right after `fragment` sits at the fragment's
/// top level and outside any comment.
fn at_top_level(fragment: &str) -> bool {
    let in_comment = match (fragment.rfind("<!--"), fragment.rfind("-->")) {
        (Some(open), Some(close)) => open > close,
        (Some(_), None) => true,
        _ => false,
    };
    !in_comment && nesting_depth(fragment) == 0
}

/// Element depth at the end of `fragment`, counting from its start.
fn nesting_depth(fragment: &str) -> i64 {
    tag_pattern().captures_iter(fragment).fold(0, |depth, caps| {
        let self_closing = caps.get(2).is_some_and(|m| m.as_str() == "/");
        match caps.get(1).map(|m| m.as_str()) {
            // comment, declaration or processing instruction
            None => depth,
            Some("/") => depth - 1,
            Some(_) if self_closing => depth,
            Some(_) => depth + 1,
        }
    })
}

/// Non-nested occurrences of `<tag ...>` inside `within`.
fn find_elements(text: &str, within: Range<usize>, tag: &str) -> FitResult<Vec<Element>> {
    let open_pattern = format!("<{tag}");
    let close_pattern = format!("</{tag}");
    let mut found = Vec::new();
    let mut cursor = within.start;

    while let Some(offset) = text[cursor..within.end].find(&open_pattern) {
        let start = cursor + offset;
        let after_name = start + open_pattern.len();
        let boundary = text[after_name..].chars().next();
        if !matches!(boundary, Some(c) if c.is_whitespace() || c == '>' || c == '/') {
            cursor = after_name;
            continue;
        }

        let gt = text[after_name..within.end]
            .find('>')
            .map(|i| after_name + i)
            .ok_or_else(|| ModelError::Malformed {
                message: format!("unterminated <{tag}> start tag at byte {start}"),
            })?;

        let self_closing = text[..gt].ends_with('/');
        let open_end = if self_closing { gt - 1 } else { gt };
        let attrs = attribute_pattern()
            .captures_iter(&text[after_name..open_end])
            .filter_map(|caps| {
                let name = caps.get(1)?;
                let value = caps.get(2)?;
                Some(Attr {
                    name: name.as_str().to_string(),
                    value: value.as_str().to_string(),
                    value_span: after_name + value.start()..after_name + value.end(),
                })
            })
            .collect();

        let inner = if self_closing {
            gt + 1..gt + 1
        } else {
            let close = text[gt + 1..within.end]
                .find(&close_pattern)
                .map(|i| gt + 1 + i)
                .ok_or_else(|| ModelError::Malformed {
                    message: format!("<{tag}> opened at byte {start} is never closed"),
                })?;
            gt + 1..close
        };

        cursor = inner.end.max(gt + 1);
        found.push(Element {
            start,
            open_end,
            inner,
            attrs,
        });
    }

    Ok(found)
}
