use tracing::Span;

pub fn trace_pipeline_pass(sources: usize) -> Span {
    tracing::info_span!(
        "pipeline_pass",
        sources = sources,
    )
}

pub fn trace_source_run(source: &str) -> Span {
    tracing::info_span!(
        "source_run",
        source = %source,
    )
}
