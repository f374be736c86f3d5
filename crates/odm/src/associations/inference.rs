//! Naming conventions - derive type names, keys and accessor names from relation names

use heck::{ToSnakeCase, ToUpperCamelCase};

/// Irregular singular/plural pairs
const IRREGULARS: &[(&str, &str)] = &[
    ("person", "people"),
    ("child", "children"),
    ("mouse", "mice"),
];

/// Strip the namespace from a type name (`Blog::Post` -> `Post`)
pub fn demodulize(type_name: &str) -> &str {
    type_name.rsplit("::").next().unwrap_or(type_name)
}

/// Namespace part of a type name (`Blog::Post` -> `Some("Blog")`)
pub fn namespace_of(type_name: &str) -> Option<&str> {
    type_name.rfind("::").map(|idx| &type_name[..idx])
}

/// Snake-case form of a type name without its namespace (`BlogPost` -> `blog_post`)
pub fn underscore(type_name: &str) -> String {
    demodulize(type_name).to_snake_case()
}

/// Type name implied by a relation name (`posts` -> `Post`, `blog_post` -> `BlogPost`)
pub fn classify(relation_name: &str, collection: bool) -> String {
    if collection {
        singularize(relation_name).to_upper_camel_case()
    } else {
        relation_name.to_upper_camel_case()
    }
}

pub fn singularize(word: &str) -> String {
    for (singular, plural) in IRREGULARS {
        if let Some(stem) = word.strip_suffix(plural) {
            return format!("{stem}{singular}");
        }
    }

    if let Some(stem) = word.strip_suffix("ies") {
        return format!("{stem}y");
    }

    for suffix in ["sses", "ches", "shes", "xes", "zes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }

    match word.strip_suffix('s') {
        Some(stem) if !stem.ends_with('s') && !stem.is_empty() => stem.to_string(),
        _ => word.to_string(),
    }
}

pub fn pluralize(word: &str) -> String {
    let irregular = IRREGULARS.iter().find(|(singular, _)| word.ends_with(singular));
    if let Some((singular, plural)) = irregular {
        return format!("{}{}", &word[..word.len() - singular.len()], plural);
    }

    if let Some(stem) = word.strip_suffix('y') {
        let before = stem.chars().last();
        if before.map(|c| !"aeiou".contains(c)).unwrap_or(false) {
            return format!("{stem}ies");
        }
    }

    if ["s", "x", "z", "ch", "sh"].iter().any(|suffix| word.ends_with(suffix)) {
        return format!("{word}es");
    }

    format!("{word}s")
}

/// Foreign key field holding a single reference (`person` -> `person_id`)
pub fn foreign_key_for(name: &str) -> String {
    format!("{name}_id")
}

/// Foreign key field holding an array of references (`tags` -> `tag_ids`)
pub fn ids_key_for(name: &str) -> String {
    format!("{}_ids", singularize(name))
}

/// Type discriminator field of a polymorphic reference (`ratable` -> `ratable_type`)
pub fn type_key_for(name: &str) -> String {
    format!("{name}_type")
}

/// Collection-style key of a type, used for counter caches and cache keys
pub fn collection_name(type_name: &str) -> String {
    pluralize(&underscore(type_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demodulize_and_namespace() {
        assert_eq!(demodulize("Blog::Admin::Post"), "Post");
        assert_eq!(demodulize("Post"), "Post");
        assert_eq!(namespace_of("Blog::Admin::Post"), Some("Blog::Admin"));
        assert_eq!(namespace_of("Post"), None);
    }

    #[test]
    fn test_underscore_and_classify() {
        assert_eq!(underscore("Blog::BlogPost"), "blog_post");
        assert_eq!(classify("posts", true), "Post");
        assert_eq!(classify("blog_post", false), "BlogPost");
        assert_eq!(classify("categories", true), "Category");
        assert_eq!(classify("people", true), "Person");
    }

    #[test]
    fn test_singularize() {
        assert_eq!(singularize("posts"), "post");
        assert_eq!(singularize("addresses"), "address");
        assert_eq!(singularize("categories"), "category");
        assert_eq!(singularize("people"), "person");
        assert_eq!(singularize("child_people"), "child_person");
        assert_eq!(singularize("boxes"), "box");
        assert_eq!(singularize("address"), "address");
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("post"), "posts");
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("day"), "days");
        assert_eq!(pluralize("address"), "addresses");
        assert_eq!(pluralize("person"), "people");
    }

    #[test]
    fn test_key_names() {
        assert_eq!(foreign_key_for("person"), "person_id");
        assert_eq!(ids_key_for("tags"), "tag_ids");
        assert_eq!(type_key_for("ratable"), "ratable_type");
        assert_eq!(collection_name("Blog::Post"), "posts");
    }
}
