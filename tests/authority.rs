//! Leaf minting under concurrency

mod common;

use std::sync::Arc;

use openssl::nid::Nid;
use openssl::x509::X509;
use synergy_proxy::tls::CertificateAuthority;

fn common_name(cert: &X509) -> String {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hosts_get_their_own_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let authority = common::authority(&dir);

    let tasks: Vec<_> = ["a.example", "b.example", "a.example", "b.example"]
        .into_iter()
        .map(|host| {
            let authority = Arc::clone(&authority);
            tokio::spawn(async move { authority.leaf_for(host).await.unwrap() })
        })
        .collect();
    let mut leaves = Vec::new();
    for task in tasks {
        leaves.push(task.await.unwrap());
    }

    assert_eq!(common_name(&leaves[0].cert), "a.example");
    assert_eq!(common_name(&leaves[1].cert), "b.example");
    assert!(Arc::ptr_eq(&leaves[0], &leaves[2]));
    assert!(Arc::ptr_eq(&leaves[1], &leaves[3]));

    let root_key = authority.root_certificate().public_key().unwrap();
    for leaf in &leaves {
        assert!(leaf.cert.verify(&root_key).unwrap());
    }
}

#[tokio::test]
async fn test_leaves_survive_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("key_store.json");
    let first = {
        let authority = Arc::new(CertificateAuthority::open_path(&path, "secret").unwrap());
        authority.leaf_for("a.example").await.unwrap().cert.to_der().unwrap()
    };

    let reopened = Arc::new(CertificateAuthority::open_path(&path, "secret").unwrap());
    let second = reopened.leaf_for("a.example").await.unwrap().cert.to_der().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_wrong_password_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("key_store.json");
    CertificateAuthority::open_path(&path, "secret").unwrap();
    assert!(CertificateAuthority::open_path(&path, "other").is_err());
}
