//! The broker namespace: exchange and queue names shared by every service.

use crate::PipelineId;

/// Exchange carrying frame envelopes from the gateway towards pipelines.
pub const EXCHANGE_CLIENTS_DATA: &str = "received_clients_data";
/// Exchange carrying branch verdicts towards the decision fuser.
pub const EXCHANGE_PIPELINE_RESULTS: &str = "pipeline_results";

/// Frame envelopes as published by the gateway.
pub const QUEUE_CLIENTS_DATA: &str = "clients_data";
/// Enforcement actions on their way back to the gateway.
pub const QUEUE_ACTIONS: &str = "actions";
/// Enriched audit records on their way to the server manager.
pub const QUEUE_SAVED_ACTIONS: &str = "saved_actions";
/// Face-branch verdicts.
pub const QUEUE_FACE_RESULTS: &str = "face_pipeline_results";
/// Phone-branch verdicts.
pub const QUEUE_PHONE_RESULTS: &str = "phone_pipeline_results";

/// Routing key binding [`QUEUE_FACE_RESULTS`] to its exchange.
pub const ROUTING_FACE_RESULTS: &str = "face_results";
/// Routing key binding [`QUEUE_PHONE_RESULTS`] to its exchange.
pub const ROUTING_PHONE_RESULTS: &str = "phone_results";

/// Face-branch input queue of the given pipeline.
pub fn pipeline_face_queue(pipeline: PipelineId) -> String {
    format!("pipeline_{pipeline}_face_data")
}

/// Phone-branch input queue of the given pipeline.
pub fn pipeline_phone_queue(pipeline: PipelineId) -> String {
    format!("pipeline_{pipeline}_phone_data")
}

/// Routing key shared by both branch queues of the given pipeline.
pub fn pipeline_routing_key(pipeline: PipelineId) -> String {
    format!("pipeline_{pipeline}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_queue_names() {
        let p = PipelineId::new(3);
        assert_eq!(pipeline_face_queue(p), "pipeline_3_face_data");
        assert_eq!(pipeline_phone_queue(p), "pipeline_3_phone_data");
        assert_eq!(pipeline_routing_key(p), "pipeline_3");
    }
}
