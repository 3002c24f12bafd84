use anyhow::{Context, Result};

use crate::provider::ProviderClient;
use crate::state::StateSnapshot;

/// Re-reads every recorded resource so the plan sees drift: objects the
/// provider no longer has are dropped (and will be re-created), changed
/// attributes replace the recorded ones.
pub async fn refresh(snapshot: &StateSnapshot, provider: &dyn ProviderClient) -> Result<StateSnapshot> {
    let mut out = snapshot.clone();
    for (id, state) in &snapshot.resources {
        let live = provider
            .read(&id.type_name, &state.provider_id)
            .await
            .with_context(|| format!("refresh {id}"))?;
        match live {
            None => {
                tracing::warn!(resource = %id, provider_id = %state.provider_id, "resource deleted outside of rekon");
                out.resources.remove(id);
            }
            Some(attrs) if attrs != state.attributes => {
                tracing::info!(resource = %id, "drift detected");
                if let Some(entry) = out.resources.get_mut(id) {
                    entry.attributes = attrs;
                }
            }
            Some(_) => {}
        }
    }
    Ok(out)
}
