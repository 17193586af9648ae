//! Output artifact naming.

use chrono::NaiveDate;
use scrivener_protocol::defaults::DEFAULT_FILENAME_TEMPLATE;
use scrivener_protocol::OutputFormat;

/// Values available to a filename template.
pub struct FilenameContext<'a> {
    pub workflow_name: &'a str,
    /// Subject file name, when the output belongs to one file.
    pub file_name: Option<&'a str>,
    /// Fan-out index, when the output belongs to one fan-out unit.
    pub index: Option<u32>,
    pub run_id: &'a str,
    pub date: NaiveDate,
}

/// Render an output filename from the workflow's template.
///
/// Placeholders: `{workflow}`, `{file}` (subject name without extension),
/// `{index}`, `{run}`, `{date}` (YYYY-MM-DD). For fan-out outputs a template
/// without `{file}` or `{index}` gets the file name appended so sibling outputs
/// stay distinguishable. The result is sanitized and carries the format's
/// extension.
pub fn render_filename(template: Option<&str>, ctx: &FilenameContext<'_>, format: OutputFormat) -> String {
    let template = template
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_FILENAME_TEMPLATE);

    let file_stem = ctx.file_name.map(file_stem).unwrap_or_default();
    let index = ctx.index.map(|i| i.to_string()).unwrap_or_default();

    let mut rendered = template
        .replace("{workflow}", ctx.workflow_name)
        .replace("{file}", file_stem)
        .replace("{index}", &index)
        .replace("{run}", ctx.run_id)
        .replace("{date}", &ctx.date.format("%Y-%m-%d").to_string());

    let names_unit = template.contains("{file}") || template.contains("{index}");
    if ctx.index.is_some() && !names_unit {
        let suffix = if file_stem.is_empty() { index.as_str() } else { file_stem };
        rendered = format!("{rendered}-{suffix}");
    }

    let mut name = sanitize(&rendered);
    if name.is_empty() {
        name = "output".to_string();
    }

    let extension = format.extension();
    if !name.to_lowercase().ends_with(&format!(".{extension}")) {
        name.push('.');
        name.push_str(extension);
    }
    name
}

fn file_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Keep letters, digits, `-`, `_`, `.` and spaces; everything else becomes `_`.
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim().trim_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(file_name: Option<&'a str>, index: Option<u32>) -> FilenameContext<'a> {
        FilenameContext {
            workflow_name: "Contract Summary",
            file_name,
            index,
            run_id: "run-7",
            date: NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(),
        }
    }

    #[test]
    fn test_default_template() {
        let name = render_filename(None, &ctx(None, None), OutputFormat::Markdown);
        assert_eq!(name, "Contract Summary-2026-03-09.md");
    }

    #[test]
    fn test_placeholders_and_extension() {
        let name = render_filename(
            Some("{run}/{file}_{index}"),
            &ctx(Some("lease.final.pdf"), Some(2)),
            OutputFormat::Json,
        );
        assert_eq!(name, "run-7_lease.final_2.json");
    }

    #[test]
    fn test_fan_out_gets_file_suffix() {
        let name = render_filename(
            Some("{workflow}"),
            &ctx(Some("a.pdf"), Some(0)),
            OutputFormat::Text,
        );
        assert_eq!(name, "Contract Summary-a.txt");
    }

    #[test]
    fn test_existing_extension_not_doubled() {
        let name = render_filename(Some("report.md"), &ctx(None, None), OutputFormat::Markdown);
        assert_eq!(name, "report.md");
    }

    #[test]
    fn test_empty_render_falls_back() {
        let name = render_filename(Some("{file}"), &ctx(None, None), OutputFormat::Html);
        assert_eq!(name, "output.html");
    }
}
