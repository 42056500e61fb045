fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use icebox_protocol::{
        ArchiveCreated, Inventory, Job, JobAction, JobList, JobParameters, StatusCode,
    };
    use icebox_transfer::{SessionStore, TransferError, UploadSession};

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Deserializes a fixture, re-serializes it, and compares the JSON
    /// values. Returns the parsed value for further checks.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  ours:    {reserialized}"
        );
        parsed
    }

    // --- Service responses ---

    #[test]
    fn fixture_describe_job_archive() {
        let job: Job = roundtrip_test("describe_job_archive.json");
        assert_eq!(job.action, JobAction::ArchiveRetrieval);
        assert_eq!(job.status_code, StatusCode::Succeeded);
        assert_eq!(job.payload_size(), Some(16 * 1024 * 1024));
        assert!(job.sha256_tree_hash.is_some());
    }

    #[test]
    fn fixture_describe_job_inventory_pending() {
        let job: Job = roundtrip_test("describe_job_inventory_pending.json");
        assert!(!job.completed);
        assert_eq!(job.completion_date, None);
        assert_eq!(job.payload_size(), None);
        assert!(job.sns_topic.is_some());
    }

    #[test]
    fn fixture_list_jobs() {
        let list: JobList = roundtrip_test("list_jobs.json");
        assert_eq!(list.jobs.len(), 2);
        assert_eq!(list.marker.as_deref(), Some("archive-job-2"));
        assert_eq!(list.jobs[0].payload_size(), Some(2140));
        assert!(list.jobs[1].is_failed());
    }

    #[test]
    fn fixture_inventory() {
        let inventory: Inventory = roundtrip_test("inventory.json");
        assert_eq!(inventory.archive_list.len(), 2);
        assert_eq!(inventory.total_size(), 10485760 + 1048577);
        assert_eq!(
            inventory.find("archive-7").unwrap().archive_description,
            "photos 2023"
        );
    }

    #[test]
    fn fixture_archive_created() {
        let created: ArchiveCreated = roundtrip_test("archive_created.json");
        assert_eq!(created.archive_id, "archive-9");
    }

    // --- Requests ---

    #[test]
    fn fixture_job_parameters() {
        let params: JobParameters = roundtrip_test("job_parameters.json");
        assert_eq!(params.action(), Some(JobAction::ArchiveRetrieval));

        let built = JobParameters::archive_retrieval("archive-7")
            .with_description("restore photos")
            .with_sns_topic("arn:aws:sns:us-west-2:012345678901:restore-ready");
        assert_eq!(built, params);
    }

    // --- Session records ---

    #[test]
    fn fixture_upload_session() {
        let session: UploadSession = roundtrip_test("upload_session.json");
        assert!(session.is_planned());
        assert_eq!(session.uploaded_count(), 1);
        assert_eq!(session.next_pending(), Some(1));
    }

    #[test]
    fn session_record_v1_loads() {
        let store = SessionStore::new(fixtures_dir().join("session_record_v1.json"));
        let session = store.load().unwrap().expect("record present");
        let expected: UploadSession = serde_json::from_value(load_fixture("upload_session.json"))
            .expect("session fixture");
        assert_eq!(session, expected);
    }

    #[test]
    fn session_record_from_newer_schema_is_refused() {
        let store = SessionStore::new(fixtures_dir().join("session_record_v2.json"));
        assert!(matches!(
            store.load(),
            Err(TransferError::UnsupportedSessionVersion { found: 2, expected: 1 })
        ));
    }
}
