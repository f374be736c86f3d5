//! Accessor and binding behaviour over the in-memory store

mod common;

use common::{raw, registry, session};
use elif_odm::{
    AssociationOptions, LoadState, MemoryStore, ModelDefinition, ModelRegistry, OdmError,
    ProxyMethod, ProxyOutput, Relation,
};
use serde_json::json;

#[tokio::test]
async fn test_push_binds_both_sides_before_save() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    let post = session.new_document("Post", raw(json!({"title": "Hello"}))).unwrap();
    session.push(person, "posts", post).await.unwrap();

    let person_id = session.id_of(person).unwrap();
    assert_eq!(session.attribute(post, "person_id").unwrap(), person_id);
    assert_eq!(session.relation(post, "person").await.unwrap(), Relation::One(Some(person)));
    let answering = session.document(post).unwrap().association().cloned().unwrap();
    assert_eq!(answering.owner, "Person");
    assert_eq!(answering.name, "posts");
    assert_eq!(store.fetch_count().await, 0);

    session.save(person).await.unwrap();
    session.save(post).await.unwrap();

    let stored = store.get("Post", &session.id_of(post).unwrap()).await.unwrap();
    assert_eq!(stored["person_id"], person_id);
    assert_eq!(session.relation(person, "posts").await.unwrap(), Relation::Many(vec![post]));
}

#[tokio::test]
async fn test_binding_twice_is_a_no_op() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    let post = session.new_document("Post", raw(json!({"title": "Hello"}))).unwrap();
    session.push(person, "posts", post).await.unwrap();
    session.push(person, "posts", post).await.unwrap();

    let proxy = session.document(person).unwrap().relation_proxy("posts").unwrap();
    assert_eq!(proxy.members(), vec![post]);
    assert_eq!(proxy.load_state(), LoadState::Unloaded);
    assert_eq!(session.relation(post, "person").await.unwrap(), Relation::One(Some(person)));
}

#[tokio::test]
async fn test_polymorphic_assignment_tracks_unloaded_inverse_without_fetching() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let movie = session.new_document("Movie", raw(json!({"title": "Heat"}))).unwrap();
    session.save(movie).await.unwrap();
    let rating = session.new_document("Rating", raw(json!({"value": 5}))).unwrap();

    session.set_one(rating, "ratable", Some(movie)).await.unwrap();

    assert_eq!(store.fetch_count().await, 0);
    assert_eq!(session.attribute(rating, "ratable_id").unwrap(), session.id_of(movie).unwrap());
    assert_eq!(session.attribute(rating, "ratable_type").unwrap(), json!("Movie"));

    let ratings = session.document(movie).unwrap().relation_proxy("ratings").unwrap();
    assert!(!ratings.is_loaded());
    assert_eq!(ratings.members(), vec![rating]);

    session.save(rating).await.unwrap();
    assert_eq!(session.relation(movie, "ratings").await.unwrap(), Relation::Many(vec![rating]));
    assert_eq!(store.fetch_count().await, 1);
}

#[tokio::test]
async fn test_polymorphic_assignment_with_two_candidate_inverses_fails() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let album = session.new_document("Album", raw(json!({}))).unwrap();
    let rating = session.new_document("Rating", raw(json!({"value": 3}))).unwrap();

    let err = session.set_one(rating, "ratable", Some(album)).await.unwrap_err();
    assert!(matches!(
        err,
        OdmError::InvalidSetPolymorphicRelation { ref target, .. } if target == "Album"
    ));
}

#[tokio::test]
async fn test_wrong_target_type_is_rejected() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    let comment = session.new_document("Comment", raw(json!({"body": "hi"}))).unwrap();

    let err = session.push(person, "posts", comment).await.unwrap_err();
    assert!(matches!(
        err,
        OdmError::WrongTargetType { ref expected, ref actual, .. }
            if expected == "Post" && actual == "Comment"
    ));
}

#[test]
fn test_inverse_resolution_is_ambiguous_without_inverse_of() {
    let registry = ModelRegistry::new();
    let mut person = ModelDefinition::new("Person");
    person
        .has_many("articles", AssociationOptions::new())
        .unwrap()
        .has_many("reviews", AssociationOptions::new().class_name("Article").inverse_of("reviewer"))
        .unwrap();
    registry.register(person);

    let mut article = ModelDefinition::new("Article");
    article
        .belongs_to("writer", AssociationOptions::new().class_name("Person"))
        .unwrap()
        .belongs_to("reviewer", AssociationOptions::new().class_name("Person"))
        .unwrap();
    registry.register(article);

    let definition = registry.require("Person").unwrap();
    let articles = definition.require_association("articles").unwrap();
    let err = articles.inverse_candidates(&registry, None).unwrap_err();
    assert!(matches!(
        err,
        OdmError::AmbiguousRelationship { ref candidates, .. } if candidates.len() == 2
    ));

    let reviews = definition.require_association("reviews").unwrap();
    assert_eq!(reviews.inverse_candidates(&registry, None).unwrap(), vec!["reviewer".to_string()]);
    assert_eq!(reviews.foreign_key(), Some("reviewer_id"));
}

#[tokio::test]
async fn test_has_and_belongs_to_many_keeps_both_key_arrays() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    let preference = session.new_document("Preference", raw(json!({"name": "tea"}))).unwrap();
    session.save(person).await.unwrap();
    session.save(preference).await.unwrap();

    session.push(person, "preferences", preference).await.unwrap();

    let person_id = session.id_of(person).unwrap();
    let preference_id = session.id_of(preference).unwrap();
    let stored_person = store.get("Person", &person_id).await.unwrap();
    let stored_preference = store.get("Preference", &preference_id).await.unwrap();
    assert_eq!(stored_person["preference_ids"], json!([preference_id.clone()]));
    assert_eq!(stored_preference["person_ids"], json!([person_id.clone()]));

    let mut fresh = common::session(&store);
    let reloaded = fresh.find("Person", person_id).await.unwrap().unwrap();
    assert_eq!(fresh.ids(reloaded, "preferences").await.unwrap(), vec![preference_id.clone()]);
    let preferences = fresh.relation(reloaded, "preferences").await.unwrap();
    assert_eq!(preferences.len(), 1);
    assert_eq!(fresh.id_of(preferences.many()[0]).unwrap(), preference_id);
}

#[tokio::test]
async fn test_autobuild_and_its_suppression() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    let built = session.relation(person, "passport").await.unwrap().one().unwrap();
    assert_eq!(session.document(built).unwrap().model(), "Passport");
    assert!(session.document(built).unwrap().is_new_record());
    assert_eq!(session.attribute(built, "person_id").unwrap(), session.id_of(person).unwrap());
    assert_eq!(session.relation(person, "passport").await.unwrap(), Relation::One(Some(built)));

    let other = session.new_document("Person", raw(json!({"name": "Bob"}))).unwrap();
    let relation = session.without_autobuild().relation(other, "passport").await.unwrap();
    assert_eq!(relation, Relation::One(None));
    assert!(!session.is_autobuild_suppressed());
    assert!(!session.exists(other, "passport").await.unwrap());
}

#[tokio::test]
async fn test_create_requires_a_persisted_base() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    let err = session
        .create(person, "posts", raw(json!({"title": "Hello"})))
        .await
        .unwrap_err();
    assert!(matches!(err, OdmError::UnsavedDocument { ref base, .. } if base == "Person"));
    assert!(store.documents("Post").await.is_empty());
}

#[tokio::test]
async fn test_counter_cache_follows_create_and_destroy() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    session.save(person).await.unwrap();
    let first = session.create(person, "posts", raw(json!({"title": "one"}))).await.unwrap();
    session.create(person, "posts", raw(json!({"title": "two"}))).await.unwrap();

    let person_id = session.id_of(person).unwrap();
    assert_eq!(store.get("Person", &person_id).await.unwrap()["posts_count"], json!(2));
    assert_eq!(session.attribute(person, "posts_count").unwrap(), json!(2));

    assert!(session.destroy(first).await.unwrap());
    assert_eq!(store.get("Person", &person_id).await.unwrap()["posts_count"], json!(1));
    assert_eq!(session.attribute(person, "posts_count").unwrap(), json!(1));
    assert_eq!(session.relation(person, "posts").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_counter_cache_moves_when_the_key_is_reassigned() {
    let store = MemoryStore::new();
    store.insert("Person", raw(json!({"_id": "p1", "posts_count": 1}))).await;
    store.insert("Person", raw(json!({"_id": "p2", "posts_count": 0}))).await;
    store.insert("Post", raw(json!({"_id": "a", "person_id": "p1"}))).await;

    let mut session = session(&store);
    let first = session.find("Person", json!("p1")).await.unwrap().unwrap();
    let second = session.find("Person", json!("p2")).await.unwrap().unwrap();
    let post = session.find("Post", json!("a")).await.unwrap().unwrap();

    session.set_one(post, "person", Some(second)).await.unwrap();
    session.save(post).await.unwrap();
    assert_eq!(store.get("Person", &json!("p1")).await.unwrap()["posts_count"], json!(0));
    assert_eq!(store.get("Person", &json!("p2")).await.unwrap()["posts_count"], json!(1));
    assert_eq!(session.attribute(first, "posts_count").unwrap(), json!(0));
    assert_eq!(session.attribute(second, "posts_count").unwrap(), json!(1));

    // saving again without a key change leaves both counters alone
    session.save(post).await.unwrap();
    assert_eq!(store.get("Person", &json!("p2")).await.unwrap()["posts_count"], json!(1));

    assert!(session.destroy(post).await.unwrap());
    assert_eq!(store.get("Person", &json!("p1")).await.unwrap()["posts_count"], json!(0));
    assert_eq!(store.get("Person", &json!("p2")).await.unwrap()["posts_count"], json!(0));
}

#[tokio::test]
async fn test_failed_fetch_leaves_relation_unloaded() {
    let store = MemoryStore::new();
    store.insert("Person", raw(json!({"_id": "p1", "name": "Ann"}))).await;
    let mut session = session(&store);
    let person = session.find("Person", json!("p1")).await.unwrap().unwrap();

    store.fail_next_fetch("connection reset").await;
    let err = session.relation(person, "posts").await.unwrap_err();
    assert!(matches!(err, OdmError::Storage(ref reason) if reason == "connection reset"));
    let loaded = session
        .document(person)
        .unwrap()
        .relation_proxy("posts")
        .map_or(false, |proxy| proxy.is_loaded());
    assert!(!loaded);

    store.insert("Post", raw(json!({"_id": "x", "person_id": "p1"}))).await;
    assert_eq!(session.relation(person, "posts").await.unwrap().len(), 1);

    store.fail_next_fetch("timeout").await;
    assert!(session.reload_relation(person, "posts").await.is_err());
    let proxy = session.document(person).unwrap().relation_proxy("posts").unwrap();
    assert_eq!(proxy.load_state(), LoadState::Unloaded);
}

#[tokio::test]
async fn test_cache_key_matches_for_unloaded_and_loaded_collections() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let person = session.new_document("Person", raw(json!({"name": "Ann"}))).unwrap();
    assert_eq!(session.cache_key(person, "posts").await.unwrap(), "posts/0");

    session.save(person).await.unwrap();
    session.create(person, "posts", raw(json!({"title": "one"}))).await.unwrap();
    session.create(person, "posts", raw(json!({"title": "two"}))).await.unwrap();

    let mut fresh = common::session(&store);
    let reloaded = fresh.find("Person", session.id_of(person).unwrap()).await.unwrap().unwrap();
    store.reset_fetch_log().await;

    let unloaded = fresh.cache_key(reloaded, "posts").await.unwrap();
    assert_eq!(store.fetch_count().await, 0);
    let (prefix, stamp) = unloaded.split_once('-').unwrap();
    assert_eq!(prefix, "posts/2");
    assert_eq!(stamp.len(), 23);
    assert!(stamp.chars().all(|c| c.is_ascii_digit()));

    fresh.relation(reloaded, "posts").await.unwrap();
    assert_eq!(fresh.cache_key(reloaded, "posts").await.unwrap(), unloaded);
}

#[tokio::test]
async fn test_forwarded_methods_follow_the_relation_kind() {
    let store = MemoryStore::new();
    store.insert("Person", raw(json!({"_id": "p1", "name": "Ann"}))).await;
    store.insert("Post", raw(json!({"_id": "a", "person_id": "p1"}))).await;
    store.insert("Post", raw(json!({"_id": "b", "person_id": "p1"}))).await;
    let mut session = session(&store);
    let person = session.find("Person", json!("p1")).await.unwrap().unwrap();

    let count = session.forward(person, "posts", ProxyMethod::Count).await.unwrap();
    assert!(matches!(count, ProxyOutput::Count(2)));
    let proxy = session.document(person).unwrap().relation_proxy("posts");
    assert!(!proxy.is_some_and(|proxy| proxy.is_loaded()));

    let found = session.forward(person, "posts", ProxyMethod::Find(json!("b"))).await.unwrap();
    let post = match found {
        ProxyOutput::Document(Some(post)) => post,
        other => panic!("expected a document, got {other:?}"),
    };
    assert_eq!(session.id_of(post).unwrap(), json!("b"));

    let err = session.forward(post, "person", ProxyMethod::Clear).await.unwrap_err();
    assert!(matches!(err, OdmError::UndefinedProxyMethod { ref method, .. } if method == "clear"));
}

#[tokio::test]
async fn test_required_belongs_to_is_validated() {
    let store = MemoryStore::new();
    let mut session = session(&store);

    let post = session.new_document("Post", raw(json!({"title": "orphan"}))).unwrap();
    let errors = session.validate_relations(post).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].attribute, "person");
    assert_eq!(errors[0].message, "must exist");
    assert!(!session.document(post).unwrap().is_valid());

    let registry = registry();
    let association = registry.require("Employee").unwrap().require_association("company").unwrap();
    assert!(!association.is_required(true));
}
