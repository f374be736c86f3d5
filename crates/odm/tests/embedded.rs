//! Embedded relations: positions, saving through the root, recursive trees and projections

mod common;

use common::{raw, session};
use elif_odm::{FetchRequest, Filter, MemoryStore, OdmError, Projection, Relation};
use serde_json::json;

#[tokio::test]
async fn test_removing_embedded_documents_reindexes_siblings() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    let mut addresses = Vec::new();
    for street in ["First", "Second", "Third"] {
        let address = session
            .build(person, "addresses", raw(json!({"street": street})))
            .await
            .unwrap();
        addresses.push(address);
    }
    for (position, address) in addresses.iter().enumerate() {
        assert_eq!(session.document(*address).unwrap().position(), Some(position));
    }
    session.save(person).await.unwrap();
    assert!(session.document(addresses[2]).unwrap().is_persisted());

    session.delete(addresses[1]).await.unwrap();
    assert!(session.document(addresses[1]).unwrap().is_destroyed());
    assert_eq!(session.document(addresses[1]).unwrap().position(), None);
    assert_eq!(session.document(addresses[2]).unwrap().position(), Some(1));

    let person_id = session.id_of(person).unwrap();
    let stored = store.get("Person", &person_id).await.unwrap();
    let streets: Vec<&str> = stored["addresses"]
        .as_array()
        .unwrap()
        .iter()
        .map(|address| address["street"].as_str().unwrap())
        .collect();
    assert_eq!(streets, vec!["First", "Third"]);

    assert!(session.remove(person, "addresses", addresses[0]).await.unwrap());
    assert_eq!(session.document(addresses[2]).unwrap().position(), Some(0));
    assert!(session.document(addresses[0]).unwrap().embedded_parent().is_none());
    let stored = store.get("Person", &person_id).await.unwrap();
    assert_eq!(stored["addresses"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_saving_an_embedded_document_saves_its_root() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    let address = session
        .build(person, "addresses", raw(json!({"street": "Main"})))
        .await
        .unwrap();
    session.save(person).await.unwrap();

    session.write_attribute(address, "city", json!("Oslo")).unwrap();
    session.save(address).await.unwrap();

    let stored = store.get("Person", &session.id_of(person).unwrap()).await.unwrap();
    assert_eq!(stored["addresses"][0]["city"], json!("Oslo"));
    assert_eq!(session.relation(address, "person").await.unwrap(), Relation::One(Some(person)));
}

#[tokio::test]
async fn test_recursive_tree_round_trips_through_the_root() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let root = session.new_document("Role", raw(json!({"name": "root"}))).unwrap();
    let child = session.new_document("Role", raw(json!({"name": "child"}))).unwrap();
    let grandchild = session.new_document("Role", raw(json!({"name": "grandchild"}))).unwrap();
    session.push(root, "child_roles", child).await.unwrap();
    session.push(child, "child_roles", grandchild).await.unwrap();

    let parent = session.relation(grandchild, "parent_role").await.unwrap();
    assert_eq!(parent, Relation::One(Some(child)));
    session.save(root).await.unwrap();
    assert!(session.document(grandchild).unwrap().is_persisted());

    let root_id = session.id_of(root).unwrap();
    let stored = store.get("Role", &root_id).await.unwrap();
    assert_eq!(stored["child_roles"][0]["name"], json!("child"));
    assert_eq!(stored["child_roles"][0]["child_roles"][0]["name"], json!("grandchild"));

    let mut fresh = common::session(&store);
    let reloaded = fresh.find("Role", root_id).await.unwrap().unwrap();
    let children = fresh.relation(reloaded, "child_roles").await.unwrap();
    assert_eq!(children.len(), 1);
    let child = children.many()[0];
    assert_eq!(fresh.attribute(child, "name").unwrap(), json!("child"));
    assert_eq!(fresh.relation(child, "parent_role").await.unwrap(), Relation::One(Some(reloaded)));

    let grandchildren = fresh.relation(child, "child_roles").await.unwrap();
    assert_eq!(fresh.attribute(grandchildren.many()[0], "name").unwrap(), json!("grandchild"));
}

#[tokio::test]
async fn test_document_embedded_in_itself_terminates() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let node = session.new_document("Role", raw(json!({"name": "loop"}))).unwrap();
    session.push(node, "child_roles", node).await.unwrap();

    assert_eq!(session.relation(node, "parent_role").await.unwrap(), Relation::One(Some(node)));
    let serialized = session.serialize(node).unwrap();
    assert_eq!(serialized["child_roles"], json!([]));

    let err = session.save(node).await.unwrap_err();
    assert!(matches!(err, OdmError::MixedRelations { .. }));
}

#[tokio::test]
async fn test_projection_applies_to_embedded_documents() {
    let store = MemoryStore::new();
    store
        .insert(
            "Person",
            raw(json!({
                "_id": "p1",
                "name": "Ann",
                "addresses": [{"_id": "a1", "street": "Main", "city": "Oslo"}]
            })),
        )
        .await;
    let mut session = session(&store);

    let request = FetchRequest::new("Person", Filter::All)
        .with_projection(Projection::only(["name", "addresses.street"]));
    let people = session.query(request, &[]).await.unwrap();
    let person = people[0];
    assert_eq!(session.document(person).unwrap().read_attribute("name").unwrap(), json!("Ann"));

    let address = session.relation(person, "addresses").await.unwrap().one().unwrap();
    let document = session.document(address).unwrap();
    assert_eq!(document.read_attribute("street").unwrap(), json!("Main"));
    assert_eq!(document.id(), &json!("a1"));
    assert!(matches!(
        document.read_attribute("city"),
        Err(OdmError::MissingAttribute { ref field, .. }) if field == "city"
    ));
}

#[tokio::test]
async fn test_reloading_an_embedded_relation_keeps_in_memory_children() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    let address = session
        .build(person, "addresses", raw(json!({"street": "Main"})))
        .await
        .unwrap();

    let reloaded = session.reload_relation(person, "addresses").await.unwrap();
    assert_eq!(reloaded, Relation::Many(vec![address]));
    assert_eq!(store.fetch_count().await, 0);
}
