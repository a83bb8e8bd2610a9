use crate::entities::{LocationType, LocationUrl, Snapshot, SnapshotName, Subvolume};
use chrono::{TimeZone, Utc};
use std::str::FromStr;

#[test]
fn snapshot_name_parse() {
    let name = SnapshotName::from_str("sx-20150102-132010-utc").unwrap();

    assert_eq!(
        name.timestamp(),
        Utc.with_ymd_and_hms(2015, 1, 2, 13, 20, 10).unwrap()
    );
}

#[test]
fn snapshot_name_parse_rejects_other_forms() {
    assert!(SnapshotName::from_str("sx-2015-01-02").is_err());
    assert!(SnapshotName::from_str("sx-20150102-132010").is_err());
    assert!(SnapshotName::from_str("temp").is_err());
    assert!(SnapshotName::from_str("sx-20151302-132010-utc").is_err());
}

#[test]
fn snapshot_name_round_trip() {
    let timestamps = vec![
        Utc.with_ymd_and_hms(2015, 1, 2, 13, 20, 10).unwrap(),
        Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap(),
        Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap(),
    ];

    for timestamp in timestamps {
        let name = SnapshotName::new(timestamp);
        assert_eq!(SnapshotName::from_str(&name.to_string()).unwrap(), name);
    }
}

#[test]
fn snapshot_name_order_matches_text_order() {
    let mut names = vec![
        SnapshotName::new(Utc.with_ymd_and_hms(2021, 5, 2, 7, 40, 32).unwrap()),
        SnapshotName::new(Utc.with_ymd_and_hms(2019, 12, 31, 23, 59, 59).unwrap()),
        SnapshotName::new(Utc.with_ymd_and_hms(2021, 5, 2, 7, 40, 31).unwrap()),
        SnapshotName::new(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
    ];

    let mut texts: Vec<String> = names.iter().map(|n| n.to_string()).collect();

    names.sort();
    texts.sort();

    assert_eq!(
        texts,
        names.iter().map(|n| n.to_string()).collect::<Vec<String>>()
    );
}

#[test]
fn subvolume_parse() {
    let subvolume =
        Subvolume::parse("ID 257 gen 30 top level 5 path sx-20150102-132010-utc").unwrap();

    assert_eq!(
        subvolume,
        Subvolume {
            id: 257,
            gen: 30,
            top_level: 5,
            path: "sx-20150102-132010-utc".into(),
        }
    );
}

#[test]
fn subvolume_parse_error() {
    assert!(Subvolume::parse("ID garbage").is_err());
    assert!(Subvolume::parse("").is_err());
}

#[test]
fn subvolume_path_components() {
    let subvolume =
        Subvolume::parse("ID 258 gen 31 top level 5 path data/.sxbackup/sx-20150102-132010-utc")
            .unwrap();

    assert_eq!(subvolume.parent_path(), "data/.sxbackup");
    assert_eq!(subvolume.name(), "sx-20150102-132010-utc");
}

#[test]
fn url_parse_local() {
    let url = LocationUrl::parse("/mnt/data").unwrap();

    assert_eq!(url.scheme, None);
    assert_eq!(url.host, None);
    assert_eq!(url.path, "/mnt/data/");
    assert!(!url.is_remote());
    assert_eq!(url.to_string(), "/mnt/data/");
}

#[test]
fn url_parse_remote() {
    let url = LocationUrl::parse("ssh://root@backup.example.org:2222/var/backups").unwrap();

    assert_eq!(url.scheme.as_deref(), Some("ssh"));
    assert_eq!(url.user.as_deref(), Some("root"));
    assert_eq!(url.host.as_deref(), Some("backup.example.org"));
    assert_eq!(url.port, Some(2222));
    assert_eq!(url.path, "/var/backups/");
    assert!(url.is_remote());
    assert_eq!(url.ssh_target().unwrap(), "root@backup.example.org");
}

#[test]
fn url_parse_remote_without_user() {
    let url = LocationUrl::parse("ssh://host/mnt/backup").unwrap();

    assert_eq!(url.user, None);
    assert_eq!(url.host.as_deref(), Some("host"));
    assert_eq!(url.ssh_target().unwrap(), "host");
}

#[test]
fn url_normalizes_trailing_separators() {
    assert_eq!(LocationUrl::parse("/mnt/data/").unwrap().path, "/mnt/data/");
    assert_eq!(
        LocationUrl::parse("/mnt/data///").unwrap().path,
        "/mnt/data/"
    );
    assert_eq!(
        LocationUrl::parse("/mnt/data").unwrap(),
        LocationUrl::parse("/mnt/data/").unwrap()
    );
}

#[test]
fn url_round_trip() {
    for text in &["/mnt/data/", "ssh://root@host:22/var/backups/", "ssh://host/x/"] {
        let url = LocationUrl::parse(text).unwrap();
        assert_eq!(&url.to_string(), text);
    }
}

#[test]
fn url_rejects_invalid_input() {
    assert!(LocationUrl::parse("").is_err());
    assert!(LocationUrl::parse("ssh://host:notaport/x").is_err());
    assert!(LocationUrl::parse("ssh://user@host").is_err());
}

#[test]
fn snapshot_displays_as_its_name() {
    let name = SnapshotName::from_str("sx-20150102-132010-utc").unwrap();
    let subvolume =
        Subvolume::parse("ID 257 gen 30 top level 5 path sx-20150102-132010-utc").unwrap();

    let listed = Snapshot::new(name, Some(subvolume.clone()));
    let created = Snapshot::new(name, None);

    assert_eq!(listed.to_string(), "sx-20150102-132010-utc");
    assert_eq!(listed.name(), name);
    assert_eq!(listed.subvolume(), Some(&subvolume));
    assert_eq!(created.subvolume(), None);
}

#[test]
fn location_type_names() {
    assert_eq!(LocationType::from_str("Source").unwrap(), LocationType::Source);
    assert_eq!(
        LocationType::from_str("Destination").unwrap(),
        LocationType::Destination
    );
    assert!(LocationType::from_str("Other").is_err());
    assert_eq!(LocationType::Source.to_string(), "Source");
    assert_eq!(LocationType::Destination.to_string(), "Destination");
}
