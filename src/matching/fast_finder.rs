//! Fast 2-D neighbour lookup over a static star list.
//!
//! The list is sliced along x, each slice sorted by y, so a box query scans
//! a handful of contiguous runs. Queries return indices into the original
//! list. The index is read-only once built; concurrent reads are safe.

use tracing::trace;

use crate::constants::DEFAULT_NSLICE;
use crate::stars::{BaseStar, BaseStarList, Point};

/// X-sliced, y-sorted index over a borrowed [`BaseStarList`].
#[derive(Debug)]
pub struct FastFinder<'a> {
    list: &'a BaseStarList,
    /// Indices into `list`, x-sorted globally then y-sorted inside slices.
    stars: Vec<u32>,
    /// `index[i]..index[i+1]` is the run of slice `i` inside `stars`.
    index: Vec<u32>,
    nslice: usize,
    xmin: f64,
    xstep: f64,
}

impl<'a> FastFinder<'a> {
    /// Build with the default slice count.
    pub fn new(list: &'a BaseStarList) -> Self {
        Self::with_slices(list, DEFAULT_NSLICE)
    }

    /// Build with `requested_slices` x slices (clamped to the list size;
    /// a single slice when all abscissae coincide).
    pub fn with_slices(list: &'a BaseStarList, requested_slices: usize) -> Self {
        let count = list.len();
        if count == 0 {
            return FastFinder {
                list,
                stars: Vec::new(),
                index: vec![0, 0],
                nslice: 1,
                xmin: 0.0,
                xstep: 0.0,
            };
        }

        let mut stars: Vec<u32> = (0..count as u32).collect();
        stars.sort_by(|&i, &j| {
            list[i as usize]
                .pos
                .x
                .partial_cmp(&list[j as usize].pos.x)
                .expect("non-finite star abscissa")
        });

        let xmin = list[stars[0] as usize].pos.x;
        let xmax = list[stars[count - 1] as usize].pos.x;
        let mut nslice = requested_slices.max(1).min(count);
        if xmin == xmax {
            nslice = 1;
        }
        let xstep = (xmax - xmin) / nslice as f64;

        // index[i] is the first star at or beyond the slice lower edge
        let mut index = vec![0u32; nslice + 1];
        let mut istar = 0usize;
        for (islice, entry) in index.iter_mut().enumerate().take(nslice).skip(1) {
            let xend = xmin + islice as f64 * xstep;
            while istar < count && list[stars[istar] as usize].pos.x < xend {
                istar += 1;
            }
            *entry = istar as u32;
        }
        index[nslice] = count as u32;

        for islice in 0..nslice {
            let run = &mut stars[index[islice] as usize..index[islice + 1] as usize];
            run.sort_by(|&i, &j| {
                list[i as usize]
                    .pos
                    .y
                    .partial_cmp(&list[j as usize].pos.y)
                    .expect("non-finite star ordinate")
            });
        }

        FastFinder {
            list,
            stars,
            index,
            nslice,
            xmin,
            xstep,
        }
    }

    /// The star closest to `p` within `max_dist` (true 2-D distance),
    /// skipping entries rejected by the optional predicate. Returns an
    /// index into the underlying list.
    pub fn find_closest(
        &self,
        p: &Point,
        max_dist: f64,
        skip: Option<&dyn Fn(&BaseStar) -> bool>,
    ) -> Option<usize> {
        let mut best = None;
        let mut min_dist2 = max_dist * max_dist;
        for idx in self.scan(p, max_dist) {
            let star = &self.list[idx];
            if skip.is_some_and(|f| f(star)) {
                continue;
            }
            let dist2 = p.dist2(&star.pos);
            if dist2 <= min_dist2 {
                best = Some(idx);
                min_dist2 = dist2;
            }
        }
        best
    }

    /// The two nearest stars within `max_dist`, as `(closest, second)`.
    /// Either entry may be `None`.
    pub fn second_closest(
        &self,
        p: &Point,
        max_dist: f64,
        skip: Option<&dyn Fn(&BaseStar) -> bool>,
    ) -> (Option<usize>, Option<usize>) {
        let mut best1 = None;
        let mut best2 = None;
        let mut dist1 = max_dist * max_dist;
        let mut dist2 = max_dist * max_dist;
        for idx in self.scan(p, max_dist) {
            let star = &self.list[idx];
            if skip.is_some_and(|f| f(star)) {
                continue;
            }
            let d2 = p.dist2(&star.pos);
            if d2 <= dist1 {
                best2 = best1;
                dist2 = dist1;
                best1 = Some(idx);
                dist1 = d2;
            } else if d2 <= dist2 {
                best2 = Some(idx);
                dist2 = d2;
            }
        }
        (best1, best2)
    }

    /// Iterate over every star whose x and y both lie within `max_dist` of
    /// `p` (axis-aligned box; the caller filters on true distance).
    pub fn scan(&self, p: &Point, max_dist: f64) -> Scan<'a, '_> {
        let (start_slice, end_slice) = if self.xstep != 0.0 {
            let start = ((p.x - max_dist - self.xmin) / self.xstep).floor() as isize;
            let end = ((p.x + max_dist - self.xmin) / self.xstep).floor() as isize + 1;
            (start.max(0), end.min(self.nslice as isize))
        } else {
            (0, 1)
        };
        trace!(start_slice, end_slice, "box scan");
        let mut scan = Scan {
            finder: self,
            current_slice: start_slice - 1,
            end_slice,
            cur: 0,
            end: 0,
            y_start: p.y - max_dist,
            y_end: p.y + max_dist,
        };
        if self.stars.is_empty() || start_slice >= self.nslice as isize || end_slice <= 0 {
            scan.current_slice = scan.end_slice; // exhausted
        }
        scan
    }

    /// Positions (into `stars`) of the y run of `islice` within
    /// `[y_start, y_end]`, both bounds inclusive and located symmetrically.
    fn range_in_slice(&self, islice: usize, y_start: f64, y_end: f64) -> (usize, usize) {
        let lo = self.index[islice] as usize;
        let hi = self.index[islice + 1] as usize;
        let run = &self.stars[lo..hi];
        let start = lo + run.partition_point(|&i| self.list[i as usize].pos.y < y_start);
        let end = lo + run.partition_point(|&i| self.list[i as usize].pos.y <= y_end);
        (start, end)
    }
}

/// Box-scan iterator yielding indices into the underlying list.
pub struct Scan<'a, 's> {
    finder: &'s FastFinder<'a>,
    current_slice: isize,
    end_slice: isize,
    cur: usize,
    end: usize,
    y_start: f64,
    y_end: f64,
}

impl Iterator for Scan<'_, '_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.cur == self.end {
            self.current_slice += 1;
            if self.current_slice >= self.end_slice {
                return None;
            }
            let (start, end) =
                self.finder
                    .range_in_slice(self.current_slice as usize, self.y_start, self.y_end);
            self.cur = start;
            self.end = end;
        }
        let idx = self.finder.stars[self.cur] as usize;
        self.cur += 1;
        Some(idx)
    }
}
