use chacha::cluster::Cluster;
use chacha::config::Node;

fn nodes(addrs: &[&str]) -> Vec<Node> {
    addrs
        .iter()
        .map(|addr| Node {
            addr: addr.to_string(),
        })
        .collect()
}

#[test]
fn test_local_node() {
    let cluster = Cluster::new("doesn't matter", "other2", &nodes(&["other1", "other2", "other3"]));
    assert_eq!(cluster.local_node(), "other2");
}

#[test]
fn test_accessors() {
    let cluster = Cluster::new("secret", "other1", &nodes(&["other1", "other2"]));

    assert_eq!(cluster.secret(), "secret");
    assert!(cluster.contains_node("other2"));
    assert!(!cluster.contains_node("other9"));

    let mut all = cluster.nodes();
    all.sort();
    assert_eq!(all, ["other1".to_string(), "other2".to_string()]);
}

#[test]
fn test_target_is_deterministic() {
    let first = Cluster::new("s", "a", &nodes(&["a", "b", "c", "d"]));
    let second = Cluster::new("s", "a", &nodes(&["d", "c", "b", "a"]));

    for key in ["test", "another", "http://example.com/a?x=1", ""] {
        assert_eq!(first.target_node(key), second.target_node(key));
    }
}

#[test]
fn test_stability_on_remove() {
    let members = ["node1:8080", "node2:8080", "node3:8080", "node4:8080"];
    let full = Cluster::new("s", members[0], &nodes(&members));

    for key in ["test", "some/other/key", "http://example.com/artifact.tar.gz"] {
        let winner = full.target_node(key).expect("winner").to_string();

        // Removing any node other than the winner must not move the key
        for removed in members.iter().filter(|node| **node != winner) {
            let remaining: Vec<&str> = members.iter().filter(|node| node != &removed).copied().collect();
            let shrunk = Cluster::new("s", remaining[0], &nodes(&remaining));
            assert_eq!(
                shrunk.target_node(key).expect("winner after removal"),
                winner,
                "removing {removed} moved key {key}"
            );
        }
    }
}

#[test]
fn test_stability_on_add() {
    let members = ["node1:8080", "node2:8080", "node3:8080"];
    let base = Cluster::new("s", members[0], &nodes(&members));

    for key in ["test", "some/other/key", "http://example.com/artifact.tar.gz"] {
        let winner = base.target_node(key).expect("winner").to_string();

        // A new member either takes the key itself or leaves it untouched
        let grown = Cluster::new("s", members[0], &nodes(&["node0:8080", "node1:8080", "node2:8080", "node3:8080"]));
        let new_winner = grown.target_node(key).expect("winner after addition");
        assert!(
            new_winner == winner || new_winner == "node0:8080",
            "adding a node moved key {key} from {winner} to {new_winner}"
        );
    }
}

#[test]
fn test_duplicate_nodes_collapse() {
    let cluster = Cluster::new("s", "a", &nodes(&["a", "a", "b"]));
    assert_eq!(cluster.nodes().len(), 2);
}

#[test]
fn test_single_node_owns_everything() {
    let cluster = Cluster::new("s", "local:8080", &nodes(&["remote:8080"]));

    for key in ["x", "y", "z"] {
        assert_eq!(cluster.target_node(key), Some("remote:8080"));
    }
}
