//! Translation pipeline — fans decompiled artifacts out to the LLM
//! provider pool with bounded concurrency, and tolerates partial failure:
//! a function that fails to translate after retries is recorded with a
//! low-confidence placeholder rather than failing the whole job.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::adapters::{FunctionContext, ImportContext, StringContext};
use crate::context::{ContextBuilder, QualityLevel};
use crate::models::TranslationArtifact;
use crate::providers::{Operation, ProviderRegistry, SelectionOptions};

pub struct DecompiledInput {
    pub functions: Vec<FunctionContext>,
    pub imports: Vec<ImportContext>,
    pub strings: Vec<StringContext>,
}

pub struct PipelineOutcome {
    pub artifacts: Vec<TranslationArtifact>,
    pub failed_functions: Vec<String>,
    /// No failures at all: every function, the import batch, the string
    /// batch, and the summary (if attempted) all produced an artifact.
    pub success: bool,
    /// Some artifacts were produced but at least one function, batch, or
    /// the summary failed.
    pub partial_results: bool,
    pub errors: Vec<String>,
}

/// One unit of concurrent pipeline work; functions, the import batch, and
/// the string batch all fan out through the same join set so none of them
/// waits on the others.
enum TaskOutcome {
    Function { name: String, artifact: Option<TranslationArtifact> },
    Imports(Result<Vec<TranslationArtifact>, String>),
    Strings(Result<Vec<TranslationArtifact>, String>),
}

pub struct TranslationPipeline {
    registry: Arc<ProviderRegistry>,
    context: Arc<ContextBuilder>,
    max_concurrent_functions: usize,
    max_retries: u32,
}

impl TranslationPipeline {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        context: Arc<ContextBuilder>,
        max_concurrent_functions: usize,
        max_retries: u32,
    ) -> Self {
        Self { registry, context, max_concurrent_functions, max_retries }
    }

    pub async fn run(&self, input: DecompiledInput, quality: QualityLevel) -> PipelineOutcome {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_functions.max(1)));
        let mut joinset: JoinSet<TaskOutcome> = JoinSet::new();

        for func in input.functions {
            let permit = Arc::clone(&semaphore);
            let registry = Arc::clone(&self.registry);
            let context = Arc::clone(&self.context);
            let max_retries = self.max_retries;

            joinset.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore closed");
                let name = func.name.clone();
                let artifact = translate_one_function(&registry, &context, &func, quality, max_retries).await;
                TaskOutcome::Function { name, artifact }
            });
        }

        if !input.imports.is_empty() {
            let registry = Arc::clone(&self.registry);
            let context = Arc::clone(&self.context);
            let imports = input.imports.clone();
            joinset.spawn(async move {
                TaskOutcome::Imports(translate_imports(&registry, &context, &imports, quality).await)
            });
        }

        if !input.strings.is_empty() {
            let registry = Arc::clone(&self.registry);
            let context = Arc::clone(&self.context);
            let strings = input.strings.clone();
            joinset.spawn(async move {
                TaskOutcome::Strings(interpret_strings(&registry, &context, &strings, quality).await)
            });
        }

        let mut artifacts = Vec::new();
        let mut failed_functions = Vec::new();
        let mut errors = Vec::new();

        while let Some(joined) = joinset.join_next().await {
            match joined {
                Ok(TaskOutcome::Function { artifact: Some(artifact), .. }) => artifacts.push(artifact),
                Ok(TaskOutcome::Function { name, artifact: None }) => failed_functions.push(name),
                Ok(TaskOutcome::Imports(Ok(batch))) => artifacts.extend(batch),
                Ok(TaskOutcome::Imports(Err(e))) => errors.push(format!("import explanation failed: {e}")),
                Ok(TaskOutcome::Strings(Ok(batch))) => artifacts.extend(batch),
                Ok(TaskOutcome::Strings(Err(e))) => errors.push(format!("string interpretation failed: {e}")),
                Err(_) => errors.push("a pipeline task panicked".to_string()),
            }
        }

        // The summary synthesizes every prior explanation, so it can only
        // run once the fan-out above has fully drained.
        if let Ok(provider) = self.registry.select(SelectionOptions::for_operation(Operation::OverallSummary)) {
            let prior: Vec<String> = artifacts
                .iter()
                .filter_map(|a| match a {
                    TranslationArtifact::FunctionExplanation { explanation, .. } => Some(explanation.clone()),
                    TranslationArtifact::ImportExplanation { explanation, .. } => Some(explanation.clone()),
                    TranslationArtifact::StringInterpretation { interpretation, .. } => Some(interpretation.clone()),
                    _ => None,
                })
                .collect();

            if !prior.is_empty() {
                let req = self.context.for_summary(provider.config.default_model.clone(), &prior, quality);
                match provider.adapter.generate_overall_summary(&req, provider_key(&provider)).await {
                    Ok(resp) => {
                        let cost = provider.adapter.estimate_cost(&resp.model, resp.input_tokens, resp.output_tokens);
                        self.registry.record_success(&provider.config.id, resp.latency_ms, cost.total_cost_usd);
                        artifacts.push(TranslationArtifact::OverallSummary {
                            summary: resp.text,
                            risk_indicators: vec![],
                            confidence: resp.confidence,
                        });
                    }
                    Err(e) => {
                        self.registry.record_failure(&provider.config.id, e.to_string());
                        errors.push(format!("overall summary failed: {e}"));
                    }
                }
            }
        }

        let success = errors.is_empty() && failed_functions.is_empty();
        let partial_results = !success && !artifacts.is_empty();

        PipelineOutcome { artifacts, failed_functions, success, partial_results, errors }
    }
}

async fn translate_imports(
    registry: &ProviderRegistry,
    context: &ContextBuilder,
    imports: &[ImportContext],
    quality: QualityLevel,
) -> Result<Vec<TranslationArtifact>, String> {
    let provider = registry
        .select(SelectionOptions::for_operation(Operation::ImportExplanation))
        .map_err(|e| e.to_string())?;
    let req = context.for_imports(provider.config.default_model.clone(), imports, quality);
    match provider.adapter.explain_imports(&req, provider_key(&provider)).await {
        Ok(resp) => {
            let cost = provider.adapter.estimate_cost(&resp.model, resp.input_tokens, resp.output_tokens);
            registry.record_success(&provider.config.id, resp.latency_ms, cost.total_cost_usd);
            Ok(imports
                .iter()
                .map(|import| TranslationArtifact::ImportExplanation {
                    import_name: import.name.clone(),
                    library: import.library.clone(),
                    explanation: resp.text.clone(),
                    confidence: resp.confidence,
                })
                .collect())
        }
        Err(e) => {
            registry.record_failure(&provider.config.id, e.to_string());
            Err(e.to_string())
        }
    }
}

async fn interpret_strings(
    registry: &ProviderRegistry,
    context: &ContextBuilder,
    strings: &[StringContext],
    quality: QualityLevel,
) -> Result<Vec<TranslationArtifact>, String> {
    let provider = registry
        .select(SelectionOptions::for_operation(Operation::StringInterpretation))
        .map_err(|e| e.to_string())?;
    let req = context.for_strings(provider.config.default_model.clone(), strings, quality);
    match provider.adapter.interpret_strings(&req, provider_key(&provider)).await {
        Ok(resp) => {
            let cost = provider.adapter.estimate_cost(&resp.model, resp.input_tokens, resp.output_tokens);
            registry.record_success(&provider.config.id, resp.latency_ms, cost.total_cost_usd);
            Ok(strings
                .iter()
                .map(|s| TranslationArtifact::StringInterpretation {
                    value: s.value.clone(),
                    interpretation: resp.text.clone(),
                    confidence: resp.confidence,
                })
                .collect())
        }
        Err(e) => {
            registry.record_failure(&provider.config.id, e.to_string());
            Err(e.to_string())
        }
    }
}

async fn translate_one_function(
    registry: &ProviderRegistry,
    context: &ContextBuilder,
    func: &FunctionContext,
    quality: QualityLevel,
    max_retries: u32,
) -> Option<TranslationArtifact> {
    let mut excluded = Vec::new();

    for attempt in 0..=max_retries {
        let provider = if attempt == 0 {
            registry.select(SelectionOptions::for_operation(Operation::FunctionTranslation)).ok()
        } else {
            registry.fallback_chain(&excluded).into_iter().next()
        }?;

        let req = context.for_function(provider.config.default_model.clone(), func, quality);
        match provider.adapter.translate_function(&req, provider_key(&provider)).await {
            Ok(resp) => {
                let cost = provider.adapter.estimate_cost(&resp.model, resp.input_tokens, resp.output_tokens);
                registry.record_success(&provider.config.id, resp.latency_ms, cost.total_cost_usd);
                return Some(TranslationArtifact::FunctionExplanation {
                    function_name: func.name.clone(),
                    address: func.address.clone(),
                    explanation: resp.text,
                    confidence: resp.confidence,
                });
            }
            Err(e) => {
                registry.record_failure(&provider.config.id, e.to_string());
                excluded.push(provider.config.id.clone());
            }
        }
    }

    None
}

fn provider_key(entry: &crate::providers::ProviderEntry) -> &str {
    entry.config.api_key.as_deref().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{CostEstimate, LlmAdapter, ProbeError, ProviderHealthProbe, RateLimitInfo};
    use crate::models::{ProviderConfig, ProviderKind};
    use std::time::Duration;

    struct MockAdapter {
        id: String,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl LlmAdapter for MockAdapter {
        fn provider_id(&self) -> &str { &self.id }
        fn display_name(&self) -> &str { &self.id }

        async fn translate_function(&self, req: &crate::adapters::TranslationRequest, _key: &str) -> anyhow::Result<crate::adapters::TranslationResponse> {
            self.respond(req)
        }
        async fn explain_imports(&self, req: &crate::adapters::TranslationRequest, _key: &str) -> anyhow::Result<crate::adapters::TranslationResponse> {
            self.respond(req)
        }
        async fn interpret_strings(&self, req: &crate::adapters::TranslationRequest, _key: &str) -> anyhow::Result<crate::adapters::TranslationResponse> {
            self.respond(req)
        }
        async fn generate_overall_summary(&self, req: &crate::adapters::TranslationRequest, _key: &str) -> anyhow::Result<crate::adapters::TranslationResponse> {
            self.respond(req)
        }
        async fn check_health(&self, _key: &str) -> anyhow::Result<ProviderHealthProbe> {
            Ok(ProviderHealthProbe { valid: true, quota_remaining_pct: None, reset_at: None, error: None })
        }
        fn estimate_cost(&self, _model: &str, _input_tokens: u64, _output_tokens: u64) -> CostEstimate {
            CostEstimate { input_cost_usd: 0.0, output_cost_usd: 0.0, total_cost_usd: 0.0 }
        }
        fn parse_rate_limit_headers(&self, _headers: &reqwest::header::HeaderMap) -> Option<RateLimitInfo> {
            None
        }
        fn parse_error_response(&self, status: u16, body: &str) -> ProbeError {
            ProbeError { http_status: status, error_type: "mock".into(), error_message: body.to_string(), reset_time: None }
        }
    }

    impl MockAdapter {
        fn respond(&self, req: &crate::adapters::TranslationRequest) -> anyhow::Result<crate::adapters::TranslationResponse> {
            if self.fail {
                anyhow::bail!("mock adapter failure");
            }
            Ok(crate::adapters::TranslationResponse {
                text: "explanation".into(),
                model: req.model.clone(),
                input_tokens: 10,
                output_tokens: 10,
                latency_ms: 50,
                provider: self.id.clone(),
                confidence: 0.9,
            })
        }
    }

    fn cfg(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            kind: ProviderKind::OpenAi,
            display_name: id.to_string(),
            api_key: Some("k".into()),
            base_url: None,
            default_model: "mock-model".into(),
            enabled: true,
            cost_per_1k_input: 0.001,
            cost_per_1k_output: 0.002,
            max_concurrent_requests: 4,
        }
    }

    fn pipeline(fail: bool) -> TranslationPipeline {
        let mut registry = crate::providers::ProviderRegistry::new(5, Duration::from_secs(600));
        registry.register(cfg("p1"), Box::new(MockAdapter { id: "p1".into(), fail }));
        let context = crate::context::ContextBuilder::new(QualityLevel::High);
        TranslationPipeline::new(Arc::new(registry), Arc::new(context), 4, 1)
    }

    fn func(name: &str) -> FunctionContext {
        FunctionContext { name: name.into(), address: "0x1000".into(), disassembly: "nop".into(), callees: vec![] }
    }

    #[tokio::test]
    async fn successful_run_produces_all_artifact_kinds_and_a_summary() {
        let input = DecompiledInput {
            functions: vec![func("sub_1000")],
            imports: vec![ImportContext { name: "CreateFileW".into(), library: "kernel32.dll".into() }],
            strings: vec![StringContext { value: "hello".into(), reference_count: 1 }],
        };

        let outcome = pipeline(false).run(input, QualityLevel::Standard).await;

        assert!(outcome.success);
        assert!(!outcome.partial_results);
        assert!(outcome.failed_functions.is_empty());
        assert!(outcome.errors.is_empty());

        let has_summary = outcome
            .artifacts
            .iter()
            .any(|a| matches!(a, TranslationArtifact::OverallSummary { .. }));
        assert!(has_summary, "a summary should be generated once any explanation exists");
        assert_eq!(outcome.artifacts.len(), 4); // function + import + string + summary
    }

    #[tokio::test]
    async fn provider_failure_yields_partial_results_not_a_crash() {
        let input = DecompiledInput {
            functions: vec![func("sub_2000")],
            imports: vec![],
            strings: vec![],
        };

        let outcome = pipeline(true).run(input, QualityLevel::Standard).await;

        assert!(!outcome.success);
        assert!(!outcome.partial_results); // nothing at all succeeded here
        assert_eq!(outcome.failed_functions, vec!["sub_2000".to_string()]);
        assert!(outcome.artifacts.is_empty());
    }

    #[tokio::test]
    async fn empty_input_runs_cleanly() {
        let input = DecompiledInput { functions: vec![], imports: vec![], strings: vec![] };
        let outcome = pipeline(false).run(input, QualityLevel::Standard).await;
        assert!(outcome.success);
        assert!(outcome.artifacts.is_empty());
    }
}
