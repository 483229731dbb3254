//! Prompt context builder — assembles the system/user prompt pair for
//! each translation operation from decompiled artifacts, without ever
//! hardcoding provider-specific wire format (that's the adapter's job).
//!
//! Prompt wording itself is treated as an opaque template keyed by
//! `(operation, quality)`; only the context values fed into the template
//! are built here.

use serde::{Deserialize, Serialize};

use crate::adapters::{FunctionContext, ImportContext, StringContext, TranslationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    TranslateFunction,
    ExplainImports,
    InterpretStrings,
    GenerateOverallSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Basic,
    Standard,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateId(pub Operation, pub QualityLevel);

pub struct ContextBuilder {
    max_quality: QualityLevel,
}

impl ContextBuilder {
    pub fn new(max_quality: QualityLevel) -> Self {
        Self { max_quality }
    }

    fn quality_for(&self, requested: QualityLevel) -> QualityLevel {
        requested.min(self.max_quality)
    }

    pub fn for_function(
        &self,
        model: String,
        func: &FunctionContext,
        quality: QualityLevel,
    ) -> TranslationRequest {
        let quality = self.quality_for(quality);
        let detail = match quality {
            QualityLevel::Basic => "Give a one-sentence summary of what this function does.",
            QualityLevel::Standard => {
                "Explain what this function does, its parameters, and return behavior in a short paragraph."
            }
            QualityLevel::High => {
                "Explain what this function does in detail: control flow, side effects, likely intent, \
                 and anything suspicious (e.g. obfuscation, anti-debugging, network/file I/O)."
            }
        };

        let callees = if func.callees.is_empty() {
            "none recorded".to_string()
        } else {
            func.callees.join(", ")
        };

        TranslationRequest {
            model,
            system_prompt: "You translate raw decompiler output into clear natural-language explanations \
                for a security analyst. Be precise; do not invent behavior the disassembly does not show."
                .to_string(),
            user_prompt: format!(
                "Function: {} at {}\nCallees: {}\nDisassembly:\n{}\n\n{}",
                func.name, func.address, callees, func.disassembly, detail
            ),
            temperature: Some(0.2),
            max_tokens: Some(match quality {
                QualityLevel::Basic => 256,
                QualityLevel::Standard => 768,
                QualityLevel::High => 1536,
            }),
        }
    }

    pub fn for_imports(&self, model: String, imports: &[ImportContext], quality: QualityLevel) -> TranslationRequest {
        let quality = self.quality_for(quality);
        let listing = imports
            .iter()
            .map(|i| format!("- {} (from {})", i.name, i.library))
            .collect::<Vec<_>>()
            .join("\n");

        TranslationRequest {
            model,
            system_prompt: "You explain what imported library functions are used for and what that implies \
                about a binary's capabilities."
                .to_string(),
            user_prompt: format!(
                "Imported functions:\n{}\n\nExplain what capabilities these imports grant the binary.",
                listing
            ),
            temperature: Some(0.2),
            max_tokens: Some(if quality == QualityLevel::High { 1024 } else { 512 }),
        }
    }

    pub fn for_strings(&self, model: String, strings: &[StringContext], quality: QualityLevel) -> TranslationRequest {
        let quality = self.quality_for(quality);
        let listing = strings
            .iter()
            .map(|s| format!("- \"{}\" (referenced {} time(s))", s.value, s.reference_count))
            .collect::<Vec<_>>()
            .join("\n");

        TranslationRequest {
            model,
            system_prompt: "You interpret embedded strings found in a binary and what they suggest about \
                its purpose (URLs, file paths, registry keys, error messages, etc.)."
                .to_string(),
            user_prompt: format!("Strings:\n{}\n\nInterpret what these strings suggest.", listing),
            temperature: Some(0.2),
            max_tokens: Some(if quality == QualityLevel::High { 1024 } else { 512 }),
        }
    }

    pub fn for_summary(&self, model: String, prior_explanations: &[String], quality: QualityLevel) -> TranslationRequest {
        let quality = self.quality_for(quality);
        let joined = prior_explanations.join("\n---\n");

        TranslationRequest {
            model,
            system_prompt: "You synthesize per-function, per-import, and per-string explanations into one \
                overall summary of a binary's likely purpose and any risk indicators."
                .to_string(),
            user_prompt: format!(
                "Prior explanations:\n{}\n\nWrite an overall summary and list any risk indicators.",
                joined
            ),
            temperature: Some(0.3),
            max_tokens: Some(match quality {
                QualityLevel::Basic => 256,
                QualityLevel::Standard => 512,
                QualityLevel::High => 1024,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_is_capped_at_provider_max() {
        let builder = ContextBuilder::new(QualityLevel::Basic);
        let func = FunctionContext {
            name: "sub_401000".into(),
            address: "0x401000".into(),
            disassembly: "push ebp; mov ebp, esp".into(),
            callees: vec![],
        };
        let req = builder.for_function("gpt-4o-mini".into(), &func, QualityLevel::High);
        assert_eq!(req.max_tokens, Some(256));
    }

    #[test]
    fn function_prompt_includes_disassembly_and_name() {
        let builder = ContextBuilder::new(QualityLevel::High);
        let func = FunctionContext {
            name: "decrypt_payload".into(),
            address: "0x402abc".into(),
            disassembly: "xor eax, eax".into(),
            callees: vec!["memcpy".into()],
        };
        let req = builder.for_function("gpt-4o".into(), &func, QualityLevel::High);
        assert!(req.user_prompt.contains("decrypt_payload"));
        assert!(req.user_prompt.contains("xor eax, eax"));
        assert!(req.user_prompt.contains("memcpy"));
    }
}
