use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use observation_harvester::area::{Area, AreaIndex, AreaType};
use observation_harvester::config::parse_config;
use observation_harvester::geometry::rectangle;
use observation_harvester::harvest::memory::MemoryBackend;
use observation_harvester::harvest::{HarvestJob, HarvestMode, HarvestRunner, HarvestStatus, Watermark};
use observation_harvester::mapping::{CellValue, DwcRecord, RawObservation, SourceRow};
use observation_harvester::sensitivity::Disclosure;
use observation_harvester::snapshot::{ReferenceData, SnapshotStore};
use observation_harvester::taxon::{Taxon, TaxonEdge, TaxonGraph};
use observation_harvester::vocabulary::{
    ExternalSystemMapping, MappingValue, Vocabulary, VocabularyField, VocabularyResolver,
    VocabularyValue,
};
use observation_harvester::{
    ConnectorError, HarvestExecutor, ProviderId, SourceBatch, SourceConnector,
};

const CONFIG: &str = r#"
[harvest]
batch_size = 2
max_concurrent_providers = 2

[areas]
required_types = ["county"]

[[providers]]
provider_id = 1
name = "Bird reports"
dataset_id = "birds"
namespace = "birds.example.org"
kind = "darwin_core"
extension_fields = ["habitat"]

[[providers]]
provider_id = 2
name = "Fish survey"
dataset_id = "fish"
namespace = "fish.example.org"
kind = "tabular"
object_type = "catch"

[providers.columns]
source_id = "CatchId"
taxon_id = "TaxonId"
latitude = "Lat"
longitude = "Lon"
event_date = "Caught"
"#;

/// Serves a fixed list of records in change-sequence order.
struct ListConnector {
    provider: ProviderId,
    records: Mutex<Vec<RawObservation>>,
}

impl ListConnector {
    fn new(provider: ProviderId, records: Vec<RawObservation>) -> Self {
        Self {
            provider,
            records: Mutex::new(records),
        }
    }

    fn push(&self, record: RawObservation) {
        self.records.lock().unwrap().push(record);
    }
}

#[async_trait]
impl SourceConnector for ListConnector {
    fn provider_id(&self) -> ProviderId {
        self.provider
    }

    async fn pull(
        &self,
        cursor: Option<&Watermark>,
        max_batch: usize,
    ) -> Result<SourceBatch, ConnectorError> {
        let records = self.records.lock().unwrap();
        let offset = match cursor {
            Some(Watermark::ChangeSequence(seq)) => *seq as usize,
            Some(other) => {
                return Err(ConnectorError::Fatal(format!("unexpected cursor {other}")))
            }
            None => 0,
        };
        let end = (offset + max_batch).min(records.len());
        Ok(SourceBatch {
            records: records[offset..end].to_vec(),
            watermark: Some(Watermark::ChangeSequence(end as u64)),
            has_more: end < records.len(),
        })
    }
}

fn reference_data() -> ReferenceData {
    let taxon = |id, name: &str, level, radius| Taxon {
        id,
        scientific_name: String::from(name),
        rank: "species".into(),
        protection_level: level,
        disturbance_radius_m: radius,
    };
    let taxa = TaxonGraph::build(
        vec![
            taxon(1, "Animalia", 0, None),
            taxon(10, "Parus major", 0, None),
            taxon(20, "Haliaeetus albicilla", 1, Some(3000)),
            taxon(30, "Salmo salar", 0, None),
        ],
        &[
            TaxonEdge::main(1, 10),
            TaxonEdge::main(1, 20),
            TaxonEdge::main(1, 30),
        ],
    )
    .unwrap();

    let areas = AreaIndex::load(
        vec![Area {
            id: 1,
            area_type: AreaType::County,
            feature_id: "03".into(),
            name: "Uppsala".into(),
            geometry: rectangle(59.0, 16.5, 60.7, 18.9),
            parent_id: None,
        }],
    );

    let vocabulary = VocabularyResolver::load(
        vec![Vocabulary {
            field: VocabularyField::Sex,
            values: vec![
                VocabularyValue { id: 1, value: "male".into() },
                VocabularyValue { id: 2, value: "female".into() },
            ],
        }],
        vec![ExternalSystemMapping {
            field: VocabularyField::Sex,
            provider_id: None,
            values: vec![
                MappingValue { raw: "M".into(), canonical_id: 1 },
                MappingValue { raw: "F".into(), canonical_id: 2 },
            ],
        }],
    )
    .unwrap();

    ReferenceData::new(taxa, areas, vocabulary)
}

fn bird(id: &str, taxon: &str, sex: &str) -> RawObservation {
    RawObservation::DarwinCore(
        DwcRecord::new()
            .with("occurrenceID", id)
            .with("taxonID", taxon)
            .with("decimalLatitude", "59.85")
            .with("decimalLongitude", "17.64")
            .with("coordinateUncertaintyInMeters", "25")
            .with("eventDate", "2024-04-20T06:15:00Z")
            .with("sex", sex)
            .with("habitat", "lake shore"),
    )
}

fn catch(id: i64, taxon: i64) -> RawObservation {
    RawObservation::Tabular(
        SourceRow::new()
            .with("CatchId", CellValue::Integer(id))
            .with("TaxonId", CellValue::Integer(taxon))
            .with("Lat", CellValue::Float(59.9))
            .with("Lon", CellValue::Float(17.2))
            .with(
                "Caught",
                CellValue::Timestamp(Utc.with_ymd_and_hms(2024, 6, 2, 4, 0, 0).unwrap()),
            ),
    )
}

#[tokio::test]
async fn test_full_then_incremental_harvest() {
    let config = parse_config(CONFIG).unwrap();
    let backend = MemoryBackend::new();
    let snapshots = Arc::new(SnapshotStore::new(reference_data()));
    let runner = Arc::new(HarvestRunner::new(&config, snapshots.clone(), backend.services()));
    let executor = HarvestExecutor::new(runner, config.harvest.max_concurrent_providers);

    let birds = Arc::new(ListConnector::new(
        1,
        vec![
            bird("b-1", "10", "M"),
            bird("b-2", "20", "F"),
            bird("b-3", "404", "M"),
        ],
    ));
    let fish = Arc::new(ListConnector::new(2, vec![catch(7, 30), catch(8, 30)]));
    let jobs = |mode| {
        vec![
            HarvestJob::new(birds.clone(), Arc::new(config.provider(1).unwrap().clone()), mode),
            HarvestJob::new(fish.clone(), Arc::new(config.provider(2).unwrap().clone()), mode),
        ]
    };

    let infos = executor
        .run_all(jobs(HarvestMode::Full), &CancellationToken::new())
        .await;
    assert!(infos.iter().all(|i| i.status == HarvestStatus::Succeeded));
    assert_eq!((infos[0].count, infos[0].invalid_count), (3, 1));
    assert_eq!(infos[1].count, 2);

    // rejected bird is reported with provenance
    let invalid = backend.invalid.records();
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].provider_id, 1);
    assert_eq!(invalid[0].source_id.as_deref(), Some("b-3"));

    let birds_out = backend.observations.active_observations(1);
    let eagle = birds_out
        .iter()
        .find(|o| o.occurrence_id == "urn:lsid:birds.example.org:observation:b-2")
        .unwrap();
    assert!(eagle.is_restricted());
    let true_point = eagle.location.true_coordinate.unwrap();
    let public_point = eagle.location.public_coordinate.unwrap();
    assert!(true_point.distance_m(&public_point) >= 3000.0);
    assert_eq!(eagle.occurrence.term(VocabularyField::Sex).unwrap().id, Some(2));
    assert_eq!(eagle.extensions["habitat"], serde_json::json!("lake shore"));

    let public = eagle.public_view();
    assert!(public.location.true_coordinate.is_none());
    assert!(matches!(public.location.disclosure, Disclosure::Generalized { .. }));

    let tit = birds_out
        .iter()
        .find(|o| o.occurrence_id.ends_with(":b-1"))
        .unwrap();
    assert_eq!(tit.location.areas[0].name, "Uppsala");
    assert_eq!(tit.public_view(), *tit);

    let fish_out = backend.observations.active_observations(2);
    let ids: Vec<_> = fish_out.iter().map(|o| o.occurrence_id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["urn:lsid:fish.example.org:catch:7", "urn:lsid:fish.example.org:catch:8"]
    );

    // new data arrives and the taxonomy is republished between cycles
    birds.push(bird("b-4", "10", "F"));
    let mut data = reference_data();
    data.taxa = Arc::new(
        TaxonGraph::build(
            vec![
                Taxon {
                    id: 10,
                    scientific_name: "Parus major".into(),
                    rank: "species".into(),
                    protection_level: 0,
                    disturbance_radius_m: None,
                },
                Taxon {
                    id: 20,
                    scientific_name: "Haliaeetus albicilla".into(),
                    rank: "species".into(),
                    protection_level: 0,
                    disturbance_radius_m: None,
                },
            ],
            &[],
        )
        .unwrap(),
    );
    assert_eq!(snapshots.publish(data), 1);

    let infos = executor
        .run_all(jobs(HarvestMode::Incremental), &CancellationToken::new())
        .await;
    assert_eq!(infos[0].status, HarvestStatus::Succeeded);
    assert_eq!(infos[0].cursor_before, Some(Watermark::ChangeSequence(3)));
    assert_eq!(infos[0].count, 1);
    assert_eq!(infos[1].count, 0);

    // incremental instance carries the earlier records forward
    let birds_out = backend.observations.active_observations(1);
    assert_eq!(birds_out.len(), 3);
    assert_eq!(backend.observations.active_observations(2).len(), 2);
}
