//! Placeholder-substitution prompt assembler.
//!
//! Template syntax: `{{name}}` for a named context input, `{{subject}}` for the
//! subject file(s), `{{knowledge}}` for knowledge context. File contents are read
//! as UTF-8 text from `<files_root>/<tenant>/<file id>`.

use async_trait::async_trait;
use scrivener_protocol::{ContextInput, FileRef};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

use crate::collaborators::{AssembledPrompt, AssemblyRequest, PromptAssembler};
use crate::error::{CoordinatorError, Result};

const SUBJECT: &str = "subject";
const KNOWLEDGE: &str = "knowledge";

pub struct TemplateAssembler {
    files_root: PathBuf,
}

impl TemplateAssembler {
    pub fn new(files_root: impl Into<PathBuf>) -> Self {
        Self {
            files_root: files_root.into(),
        }
    }

    async fn read_file(&self, tenant_id: &str, file: &FileRef) -> Result<String> {
        if !is_plain_segment(tenant_id) || !is_plain_segment(&file.id) {
            return Err(CoordinatorError::generation(format!(
                "File '{}' has an invalid id",
                file.name
            )));
        }
        let path = self.files_root.join(tenant_id).join(&file.id);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            CoordinatorError::generation(format!("Could not read file '{}': {}", file.name, e))
        })?;
        String::from_utf8(bytes).map_err(|_| {
            CoordinatorError::generation(format!("File '{}' is not UTF-8 text", file.name))
        })
    }

    async fn render_subjects(&self, tenant_id: &str, subjects: &[&FileRef]) -> Result<String> {
        match subjects {
            [] => Ok(String::new()),
            [only] => self.read_file(tenant_id, only).await,
            many => {
                let mut sections = Vec::with_capacity(many.len());
                for file in many {
                    let content = self.read_file(tenant_id, file).await?;
                    sections.push(format!("## {}\n\n{}", file.name, content));
                }
                Ok(sections.join("\n\n"))
            }
        }
    }
}

#[async_trait]
impl PromptAssembler for TemplateAssembler {
    async fn assemble(&self, request: AssemblyRequest<'_>) -> Result<AssembledPrompt> {
        let mut warnings = Vec::new();

        for role in request.input_roles {
            if role.required
                && role.name != SUBJECT
                && !request.context_inputs.contains_key(&role.name)
            {
                warnings.push(format!("Required input '{}' was not provided", role.name));
            }
        }

        let mut prompt = String::with_capacity(request.template.len());
        let mut unknown = BTreeSet::new();
        let mut rest = request.template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            prompt.push_str(&rest[..start]);
            let raw = &rest[start..start + 2 + len + 2];
            let name = rest[start + 2..start + 2 + len].trim();

            match name {
                SUBJECT => {
                    if request.subjects.is_empty() {
                        warnings.push("Template references {{subject}} but no subject file was given".to_string());
                    }
                    prompt.push_str(&self.render_subjects(request.tenant_id, request.subjects).await?);
                }
                KNOWLEDGE => match request.knowledge {
                    Some(knowledge) => prompt.push_str(knowledge),
                    None => warnings.push(
                        "Template references {{knowledge}} but no knowledge context is available"
                            .to_string(),
                    ),
                },
                _ => match request.context_inputs.get(name) {
                    Some(ContextInput::Text { value }) => prompt.push_str(value),
                    Some(ContextInput::File { file }) => {
                        prompt.push_str(&self.read_file(request.tenant_id, file).await?)
                    }
                    None => {
                        if unknown.insert(name.to_string()) {
                            warnings.push(format!("Unknown placeholder {} left unchanged", raw));
                        }
                        prompt.push_str(raw);
                    }
                },
            }

            rest = &rest[start + 2 + len + 2..];
        }
        prompt.push_str(rest);

        debug!(
            tenant_id = request.tenant_id,
            chars = prompt.len(),
            warnings = warnings.len(),
            "Prompt assembled"
        );
        Ok(AssembledPrompt { prompt, warnings })
    }
}

fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrivener_protocol::InputRole;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn file(id: &str, name: &str) -> FileRef {
        FileRef {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: None,
        }
    }

    fn setup() -> (TempDir, TemplateAssembler) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("t-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("f-1"), "First body").unwrap();
        std::fs::write(dir.join("f-2"), "Second body").unwrap();
        std::fs::write(dir.join("style"), "Be brief.").unwrap();
        let assembler = TemplateAssembler::new(tmp.path());
        (tmp, assembler)
    }

    #[tokio::test]
    async fn test_substitutes_inputs_and_subject() {
        let (_tmp, assembler) = setup();
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "tone".to_string(),
            ContextInput::Text {
                value: "formal".to_string(),
            },
        );
        inputs.insert(
            "guide".to_string(),
            ContextInput::File {
                file: file("style", "style.txt"),
            },
        );
        let subject = file("f-1", "a.txt");

        let assembled = assembler
            .assemble(AssemblyRequest {
                tenant_id: "t-1",
                template: "Tone: {{tone}}. {{ guide }}\n{{subject}}",
                input_roles: &[],
                context_inputs: &inputs,
                subjects: &[&subject],
                knowledge: None,
            })
            .await
            .unwrap();

        assert_eq!(assembled.prompt, "Tone: formal. Be brief.\nFirst body");
        assert!(assembled.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_batch_subjects_get_headers() {
        let (_tmp, assembler) = setup();
        let a = file("f-1", "a.txt");
        let b = file("f-2", "b.txt");

        let assembled = assembler
            .assemble(AssemblyRequest {
                tenant_id: "t-1",
                template: "{{subject}}",
                input_roles: &[],
                context_inputs: &BTreeMap::new(),
                subjects: &[&a, &b],
                knowledge: None,
            })
            .await
            .unwrap();

        assert_eq!(
            assembled.prompt,
            "## a.txt\n\nFirst body\n\n## b.txt\n\nSecond body"
        );
    }

    #[tokio::test]
    async fn test_warnings_for_unknown_and_missing() {
        let (_tmp, assembler) = setup();
        let roles = vec![InputRole {
            name: "audience".to_string(),
            required: true,
            description: None,
        }];

        let assembled = assembler
            .assemble(AssemblyRequest {
                tenant_id: "t-1",
                template: "{{mystery}} {{mystery}} {{knowledge}}",
                input_roles: &roles,
                context_inputs: &BTreeMap::new(),
                subjects: &[],
                knowledge: None,
            })
            .await
            .unwrap();

        assert_eq!(assembled.prompt, "{{mystery}} {{mystery}} ");
        assert_eq!(assembled.warnings.len(), 3);
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (_tmp, assembler) = setup();
        let evil = file("../t-1/f-1", "evil");
        let result = assembler
            .assemble(AssemblyRequest {
                tenant_id: "t-1",
                template: "{{subject}}",
                input_roles: &[],
                context_inputs: &BTreeMap::new(),
                subjects: &[&evil],
                knowledge: None,
            })
            .await;
        assert!(matches!(result, Err(CoordinatorError::Generation(_))));
    }
}
