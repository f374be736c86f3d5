//! Shared model fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Arc;

use elif_odm::{
    AssociationOptions, DependentStrategy, FieldType, MemoryStore, ModelDefinition, ModelRegistry,
    OdmConfig, RawDocument, Session,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Route engine logs to the test harness; `RUST_LOG=elif_odm=debug` shows them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn raw(value: Value) -> RawDocument {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn registry() -> ModelRegistry {
    let registry = ModelRegistry::new();

    let mut person = ModelDefinition::new("Person");
    person.field("name", FieldType::String);
    person
        .has_many("posts", AssociationOptions::new())
        .unwrap()
        .has_one("passport", AssociationOptions::new().autobuild())
        .unwrap()
        .embeds_many("addresses", AssociationOptions::new())
        .unwrap()
        .has_and_belongs_to_many("preferences", AssociationOptions::new())
        .unwrap();
    registry.register(person);

    let mut post = ModelDefinition::new("Post");
    post.field("title", FieldType::String).field("updated_at", FieldType::Time);
    post.belongs_to("person", AssociationOptions::new().counter_cache())
        .unwrap()
        .has_many("comments", AssociationOptions::new())
        .unwrap();
    registry.register(post);

    let mut comment = ModelDefinition::new("Comment");
    comment.field("body", FieldType::String);
    comment.belongs_to("post", AssociationOptions::new()).unwrap();
    registry.register(comment);

    let mut passport = ModelDefinition::new("Passport");
    passport.field("number", FieldType::String);
    passport.belongs_to("person", AssociationOptions::new()).unwrap();
    registry.register(passport);

    let mut address = ModelDefinition::new("Address");
    address.field("street", FieldType::String).field("city", FieldType::String);
    address.embedded_in("person", AssociationOptions::new()).unwrap();
    registry.register(address);

    let mut preference = ModelDefinition::new("Preference");
    preference.field("name", FieldType::String);
    preference
        .has_and_belongs_to_many("people", AssociationOptions::new())
        .unwrap();
    registry.register(preference);

    let mut movie = ModelDefinition::new("Movie");
    movie.field("title", FieldType::String);
    movie.has_many("ratings", AssociationOptions::new().as_role("ratable")).unwrap();
    registry.register(movie);

    let mut book = ModelDefinition::new("Book");
    book.field("title", FieldType::String);
    book.has_many("ratings", AssociationOptions::new().as_role("ratable")).unwrap();
    registry.register(book);

    let mut album = ModelDefinition::new("Album");
    album
        .has_many("ratings", AssociationOptions::new().as_role("ratable"))
        .unwrap()
        .has_many("reviews", AssociationOptions::new().class_name("Rating").as_role("ratable"))
        .unwrap();
    registry.register(album);

    let mut rating = ModelDefinition::new("Rating");
    rating.field("value", FieldType::Integer);
    rating.belongs_to("ratable", AssociationOptions::new().polymorphic()).unwrap();
    registry.register(rating);

    let mut role = ModelDefinition::new("Role");
    role.field("name", FieldType::String);
    role.recursively_embeds_many().unwrap();
    registry.register(role);

    let mut blog = ModelDefinition::new("Blog");
    blog
        .has_many(
            "entries",
            AssociationOptions::new().dependent(DependentStrategy::RestrictWithException),
        )
        .unwrap()
        .has_many("notes", AssociationOptions::new().dependent(DependentStrategy::DeleteAll))
        .unwrap();
    registry.register(blog);

    let mut entry = ModelDefinition::new("Entry");
    entry.belongs_to("blog", AssociationOptions::new()).unwrap();
    registry.register(entry);

    let mut note = ModelDefinition::new("Note");
    note.belongs_to("blog", AssociationOptions::new()).unwrap();
    registry.register(note);

    let mut team = ModelDefinition::new("Team");
    team
        .has_many(
            "members",
            AssociationOptions::new().dependent(DependentStrategy::RestrictWithError),
        )
        .unwrap();
    registry.register(team);

    let mut member = ModelDefinition::new("Member");
    member.belongs_to("team", AssociationOptions::new()).unwrap();
    registry.register(member);

    let mut forum = ModelDefinition::new("Forum");
    forum
        .has_many("topics", AssociationOptions::new().dependent(DependentStrategy::Destroy))
        .unwrap();
    registry.register(forum);

    let mut topic = ModelDefinition::new("Topic");
    topic
        .belongs_to("forum", AssociationOptions::new())
        .unwrap()
        .has_many("replies", AssociationOptions::new().dependent(DependentStrategy::DeleteAll))
        .unwrap();
    registry.register(topic);

    let mut reply = ModelDefinition::new("Reply");
    reply.belongs_to("topic", AssociationOptions::new()).unwrap();
    registry.register(reply);

    let mut company = ModelDefinition::new("Company");
    company
        .has_many("employees", AssociationOptions::new().dependent(DependentStrategy::Nullify))
        .unwrap();
    registry.register(company);

    let mut employee = ModelDefinition::new("Employee");
    employee.belongs_to("company", AssociationOptions::new().optional()).unwrap();
    registry.register(employee);

    registry
}

pub fn session(store: &MemoryStore) -> Session {
    init_tracing();
    Session::new(registry(), Arc::new(store.clone()))
}

pub fn session_with_config(store: &MemoryStore, config: OdmConfig) -> Session {
    session(store).with_config(config)
}
