use anyhow::Context;

/// Drive `request` to completion on a current-thread runtime.
pub fn block_on<Fut: Future>(request: Fut) -> anyhow::Result<Fut::Output> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    Ok(rt.block_on(request))
}
