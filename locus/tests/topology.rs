//! Multi-rank tests: one thread per rank over a `LocalCluster`.

use locus::{
    Connection, ConnectionState, LocalCluster, LocalSubstrate, LocaleMap, LocusConfig, Substrate,
    Topology,
};

/// Initialize a connection on every rank, run `f`, then finalize.
fn with_job<F, T>(hosts: &[&str], f: F) -> Vec<T>
where
    F: Fn(&Connection<LocalSubstrate>) -> T + Sync,
    T: Send,
{
    LocalCluster::new(hosts.iter().copied()).run(|substrate| {
        let mut conn = Connection::connect(substrate, LocusConfig::propagating()).unwrap();
        let out = f(&conn);
        conn.finalize().unwrap();
        out
    })
}

fn topologies(hosts: &[&str]) -> Vec<Topology> {
    with_job(hosts, |conn| *conn.topology())
}

fn coords(t: &Topology) -> (i32, i32, i32) {
    (t.locale, t.locale_rank, t.locale_size)
}

#[test]
fn test_two_nodes_two_ranks_each() {
    let topos = topologies(&["A", "A", "B", "B"]);
    for (rank, t) in topos.iter().enumerate() {
        assert_eq!(t.rank, rank as i32);
        assert_eq!(t.size, 4);
        assert_eq!(t.locales, 2);
    }
    assert_eq!(coords(&topos[0]), (0, 0, 2));
    assert_eq!(coords(&topos[1]), (0, 1, 2));
    assert_eq!(coords(&topos[2]), (1, 0, 2));
    assert_eq!(coords(&topos[3]), (1, 1, 2));
}

#[test]
fn test_first_appearance_assignment() {
    let topos = topologies(&["X", "Y", "X"]);
    assert!(topos.iter().all(|t| t.locales == 2));
    assert_eq!(coords(&topos[0]), (0, 0, 2));
    assert_eq!(coords(&topos[1]), (1, 0, 1));
    assert_eq!(coords(&topos[2]), (0, 1, 2));
}

#[test]
fn test_single_process_job() {
    let topos = topologies(&["solo"]);
    assert_eq!(
        topos,
        vec![Topology {
            rank: 0,
            size: 1,
            locales: 1,
            locale: 0,
            locale_rank: 0,
            locale_size: 1,
        }]
    );
}

#[test]
fn test_every_rank_on_its_own_host() {
    let hosts = ["n0", "n1", "n2", "n3", "n4", "n5"];
    let topos = topologies(&hosts);
    for t in &topos {
        assert_eq!(t.locales, 6);
        assert_eq!(t.locale, t.rank);
        assert_eq!(t.locale_rank, 0);
        assert_eq!(t.locale_size, 1);
    }
}

#[test]
fn test_every_rank_on_one_host() {
    let topos = topologies(&["big"; 8]);
    for t in &topos {
        assert_eq!(t.locales, 1);
        assert_eq!(t.locale, 0);
        assert_eq!(t.locale_rank, t.rank);
        assert_eq!(t.locale_size, 8);
    }
}

#[test]
fn test_all_ranks_agree_on_locale_map() {
    let hosts = ["c", "a", "c", "b", "a", "c"];
    let maps: Vec<LocaleMap> = with_job(&hosts, |conn| conn.locale_map().unwrap().clone());
    assert!(maps.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(maps[0].leads(), vec![0, 1, 3]);
    assert_eq!(maps[0].group(0).unwrap().members, vec![0, 2, 5]);
}

#[test]
fn test_locale_scope_matches_assignment() {
    let hosts = ["p", "q", "p", "q", "q", "r"];
    let checks = with_job(&hosts, |conn| {
        let scope = conn.locale_scope().unwrap();
        let map = conn.locale_map().unwrap();
        let group = map.group(conn.locale()).unwrap();
        (
            conn.substrate().scope_rank(scope) == conn.locale_rank(),
            conn.substrate().scope_size(scope) == conn.locale_size(),
            scope.members() == group.members.as_slice(),
        )
    });
    for (rank, check) in checks.iter().enumerate() {
        assert_eq!(*check, (true, true, true), "rank {rank}");
    }
}

#[test]
fn test_locale_barrier_stays_on_its_node() {
    // Locales run different numbers of node-local barriers; this only
    // completes if each barrier involves its own node alone.
    let done = with_job(&["A", "A", "B", "B", "B"], |conn| {
        let rounds = if conn.locale() == 0 { 3 } else { 7 };
        for _ in 0..rounds {
            conn.locale_barrier().unwrap();
        }
        conn.barrier().unwrap();
        rounds
    });
    assert_eq!(done, vec![3, 3, 7, 7, 7]);
}

#[test]
fn test_hostname_reports_launch_host() {
    let names = with_job(&["gpu-0", "gpu-1"], |conn| conn.hostname().unwrap());
    assert_eq!(names, vec!["gpu-0", "gpu-1"]);
}

#[test]
fn test_lead_flags() {
    let flags = with_job(&["A", "B", "A", "B"], |conn| {
        (conn.is_locale_lead(), conn.is_single_locale())
    });
    assert_eq!(
        flags,
        vec![(true, false), (true, false), (false, false), (false, false)]
    );
}

#[test]
fn test_drop_without_finalize_shuts_down_every_rank() {
    let cluster = LocalCluster::new(["A", "A", "B"]);
    let states = cluster.run(|substrate| {
        let conn = Connection::connect(substrate, LocusConfig::propagating()).unwrap();
        conn.barrier().unwrap();
        conn.state()
    });
    assert!(states.iter().all(|s| *s == ConnectionState::Initialized));
    for rank in 0..3 {
        assert!(cluster.is_rank_shutdown(rank), "rank {rank} left running");
    }
}

#[test]
fn test_finalize_releases_substrate() {
    let cluster = LocalCluster::new(["A", "B"]);
    let shut = cluster.run(|substrate| {
        let mut conn = Connection::connect(substrate, LocusConfig::propagating()).unwrap();
        conn.finalize().unwrap();
        conn.substrate().is_shutdown()
    });
    assert_eq!(shut, vec![true, true]);
}
